//! Pull-style parser over the reports embedded in one LE-Meta
//! `LE Advertising Report` event (§4.10).
//!
//! Layout after the subevent code byte: `num_reports(1)`, then per-report
//! `event_type(1) address_type(1) address(6) data_length(1) data(data_length)`,
//! and finally, after *all* report headers/data, one trailing `rssi(1)` byte
//! per report, in the same order.

const REPORT_HEADER_SIZE: usize = 1 + 1 + 6 + 1; // event_type, address_type, address, data_length

pub struct AdvertisingReport<'a> {
    pub event_type: u8,
    pub address_type: u8,
    pub address: [u8; 6],
    pub data: &'a [u8],
    pub rssi: i8,
}

pub struct AdvertisingReportParser<'a> {
    payload: &'a [u8],
    cursor: usize,
    rssi_cursor: usize,
    remaining_reports: u16,
    remaining_bytes: usize,
    encountered_error: bool,
}

impl<'a> AdvertisingReportParser<'a> {
    /// `payload` is the LE-Meta event's parameters *including* the leading
    /// subevent-code byte.
    pub fn new(payload: &'a [u8]) -> Self {
        if payload.len() < 2 {
            return AdvertisingReportParser {
                payload,
                cursor: payload.len(),
                rssi_cursor: payload.len(),
                remaining_reports: 0,
                remaining_bytes: 0,
                encountered_error: true,
            };
        }
        let num_reports = payload[1] as u16;
        // remaining_bytes is the space available for per-report header+data;
        // the trailing RSSI bytes (one per report) are reserved up front.
        let header_region_end = payload.len().saturating_sub(num_reports as usize);
        AdvertisingReportParser {
            payload,
            cursor: 2,
            rssi_cursor: header_region_end,
            remaining_reports: num_reports,
            remaining_bytes: header_region_end.saturating_sub(2),
            encountered_error: header_region_end < 2,
        }
    }

    /// `remaining_reports == 0 <=> remaining_bytes == 0` is the additional
    /// invariant this guards (§4.10).
    pub fn has_more_reports(&self) -> bool {
        if self.encountered_error {
            return false;
        }
        debug_assert_eq!(self.remaining_reports == 0, self.remaining_bytes == 0);
        self.remaining_reports > 0
    }

    /// Decodes one report. Latches `encountered_error` (sticky for all future
    /// calls) on any bounds violation instead of panicking or reading past
    /// the event payload (§4.10, §8).
    pub fn next_report(&mut self) -> Option<AdvertisingReport<'a>> {
        if self.encountered_error || self.remaining_reports == 0 {
            return None;
        }
        let header_start = self.cursor;
        if self.remaining_bytes < REPORT_HEADER_SIZE {
            self.encountered_error = true;
            return None;
        }
        let data_length = self.payload[header_start + REPORT_HEADER_SIZE - 1] as usize;
        let report_size = REPORT_HEADER_SIZE + data_length + 1; // +1 for the trailing rssi byte
        if report_size > self.remaining_bytes + 1 || self.rssi_cursor >= self.payload.len() {
            self.encountered_error = true;
            return None;
        }
        let data_start = header_start + REPORT_HEADER_SIZE;
        let data_end = data_start + data_length;
        if data_end > self.payload.len() {
            self.encountered_error = true;
            return None;
        }
        let mut address = [0u8; 6];
        address.copy_from_slice(&self.payload[header_start + 2..header_start + 8]);
        let report = AdvertisingReport {
            event_type: self.payload[header_start],
            address_type: self.payload[header_start + 1],
            address,
            data: &self.payload[data_start..data_end],
            rssi: self.payload[self.rssi_cursor] as i8,
        };
        self.cursor = data_end;
        self.remaining_bytes -= REPORT_HEADER_SIZE + data_length;
        self.rssi_cursor += 1;
        self.remaining_reports -= 1;
        Some(report)
    }
}
