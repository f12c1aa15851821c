#![no_main]

use libfuzzer_sys::fuzz_target;
use process_monitor::{ProcessEvent, ProcessEventData};

fuzz_target!(|data: &[u8]| {
    // Fill a wire record from arbitrary bytes; the string fields may hold
    // invalid UTF-8, no NUL, or an unknown event type
    let mut record = ProcessEventData::default();
    let (tag, rest) = data.split_at(data.len().min(record.event_type.len()));
    record.event_type[..tag.len()].copy_from_slice(tag);
    let name_len = rest.len().min(record.process_name.len());
    record.process_name[..name_len].copy_from_slice(&rest[..name_len]);

    if let Ok(event) = ProcessEvent::try_from(&record) {
        // A decoded record must survive a round trip through the wire format
        let encoded = ProcessEventData::from(&event);
        let decoded = ProcessEvent::try_from(&encoded).expect("re-decode failed");
        assert_eq!(decoded.kind(), event.kind());
    }
});
