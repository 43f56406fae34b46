//! Call detail records, assembled over a call's lifetime and emitted once at
//! final teardown.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::SystemTime;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Inbound,
    Outbound,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Answered,
    NoAnswer,
    Busy,
    Failed,
}

/// One finalized call record
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call_id: String,
    /// Distinguishes the legs of a B2BUA call
    pub leg: u8,

    pub start_time: SystemTime,
    pub answer_time: Option<SystemTime>,
    pub end_time: SystemTime,

    pub caller: String,
    pub callee: String,
    pub direction: CallDirection,
    pub disposition: Disposition,
    pub hangup_cause: String,

    pub recording_file: Option<String>,
    /// Nodes the call passed on its way through routing
    pub flow_path: Vec<String>,
}

/// Accumulates a record while the call is alive
#[derive(Debug)]
pub struct CdrBuilder {
    pub call_id: String,
    pub leg: u8,
    pub start_time: SystemTime,
    pub answer_time: Option<SystemTime>,
    pub caller: String,
    pub callee: String,
    pub direction: CallDirection,
    pub recording_file: Option<String>,
    pub flow_path: Vec<String>,
}

impl CdrBuilder {
    /// Start a record; `start_time` is the INVITE's arrival timestamp, which
    /// is preserved even when push-wake delays the actual ringing
    pub fn new(
        call_id: impl Into<String>,
        start_time: SystemTime,
        caller: impl Into<String>,
        callee: impl Into<String>,
        direction: CallDirection,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            leg: 0,
            start_time,
            answer_time: None,
            caller: caller.into(),
            callee: callee.into(),
            direction,
            recording_file: None,
            flow_path: Vec::new(),
        }
    }

    pub fn answered(&mut self) {
        if self.answer_time.is_none() {
            self.answer_time = Some(SystemTime::now());
        }
    }

    pub fn push_flow_node(&mut self, node: impl Into<String>) {
        self.flow_path.push(node.into());
    }

    pub fn finalize(self, disposition: Disposition, hangup_cause: impl Into<String>) -> CallRecord {
        CallRecord {
            call_id: self.call_id,
            leg: self.leg,
            start_time: self.start_time,
            answer_time: self.answer_time,
            end_time: SystemTime::now(),
            caller: self.caller,
            callee: self.callee,
            direction: self.direction,
            disposition,
            hangup_cause: hangup_cause.into(),
            recording_file: self.recording_file,
            flow_path: self.flow_path,
        }
    }
}

/// Downstream persistence of finalized records.
///
/// Delivery is at-least-once; consumers deduplicate by `(call_id, leg)`.
pub trait CdrSink: Send + Sync + 'static {
    fn emit(&self, record: CallRecord);
}

/// Sink feeding a channel, deduplicating by `(call_id, leg)` before handing
/// the record over
pub struct ChannelCdrSink {
    sender: mpsc::UnboundedSender<CallRecord>,
    seen: Mutex<HashSet<(String, u8)>>,
}

impl ChannelCdrSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CallRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();

        (
            Self {
                sender,
                seen: Mutex::new(HashSet::new()),
            },
            receiver,
        )
    }
}

impl CdrSink for ChannelCdrSink {
    fn emit(&self, record: CallRecord) {
        {
            let mut seen = self.seen.lock();

            if seen.len() > 65_536 {
                seen.clear();
            }

            if !seen.insert((record.call_id.clone(), record.leg)) {
                return;
            }
        }

        if self.sender.send(record).is_err() {
            log::warn!("CDR consumer is gone, record lost");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duplicate_records_are_dropped() {
        let (sink, mut rx) = ChannelCdrSink::new();

        let builder = CdrBuilder::new(
            "abc",
            SystemTime::now(),
            "alice",
            "100",
            CallDirection::Inbound,
        );

        let record = builder.finalize(Disposition::Answered, "normal_clearing");

        sink.emit(record.clone());
        sink.emit(record);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn answer_time_set_once() {
        let mut builder = CdrBuilder::new(
            "abc",
            SystemTime::now(),
            "alice",
            "100",
            CallDirection::Inbound,
        );

        builder.answered();
        let first = builder.answer_time;

        builder.answered();
        assert_eq!(builder.answer_time, first);
    }
}
