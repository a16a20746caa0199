//! Runs a list of commands strictly in order over a `CommandChannel`,
//! aborting on the first failure (§4.9).
use crate::command_channel::CommandChannel;
use crate::error::{HciError, Result};
use crate::packet::{CommandPacket, EventCode, EventPacket};

/// One command plus the event that completes it.
pub struct QueuedCommand {
    pub packet: CommandPacket,
    pub complete_event: EventCode,
}

/// A single-shot, cancelable runner over an ordered command list. Built
/// fresh for each `run_commands` call; a `CommandChannel` can have many
/// runners alive at once since queuing is otherwise uncoordinated (§5).
pub struct SequentialCommandRunner {
    channel: CommandChannel,
    canceled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

/// Handle to cancel an in-progress run. Cancelling does not unsend a command
/// already in flight; the run simply stops issuing further commands and
/// resolves with `Canceled` (§4.9).
#[derive(Clone)]
pub struct RunnerCancelHandle {
    canceled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl RunnerCancelHandle {
    pub fn cancel(&self) {
        self.canceled.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl SequentialCommandRunner {
    pub fn new(channel: CommandChannel) -> Self {
        SequentialCommandRunner {
            channel,
            canceled: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel_handle(&self) -> RunnerCancelHandle {
        RunnerCancelHandle {
            canceled: self.canceled.clone(),
        }
    }

    /// Runs every command to completion in order. Stops at the first command
    /// whose completion event reports a non-success status, or the first
    /// time cancellation is observed between commands, and returns that
    /// error; all later commands in the list are never sent (§4.9).
    pub async fn run(&self, commands: Vec<QueuedCommand>) -> Result<Vec<EventPacket>> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            if self.canceled.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(HciError::Canceled);
            }
            let (_id, fut) = self.channel.send(command.packet, command.complete_event);
            let event = fut.await?;
            results.push(event);
        }
        Ok(results)
    }
}
