//! End-to-end behaviour of the synchronous sender against a local collector.

mod test_utils;

use std::{collections::BTreeMap, time::Duration};

use femtofluent::{ErrorKind, EventTime, OverflowHandler, SenderBuilder, SenderError, Timestamp};
use rmpv::Value;
use rstest::rstest;
use serde::{Serialize, Serializer, ser::Error as _};
use test_utils::{
    Collector,
    fixtures::{Overflowed, collector, overflow, refused_port},
};

const WAIT: Duration = Duration::from_secs(5);

fn sender_for(collector: &Collector) -> SenderBuilder {
    SenderBuilder::new("test")
        .with_host(collector.host())
        .with_port(collector.port())
        .with_timeout_ms(1000)
}

fn record(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

struct Unserialisable;

impl Serialize for Unserialisable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom("refusing to serialise"))
    }
}

#[rstest]
fn label_is_appended_to_base_tag(collector: Collector) {
    let sender = sender_for(&collector).build().unwrap();
    assert!(sender.emit("foo", &record(&[("bar", "baz")])).unwrap());
    let messages = collector.wait_for(1, WAIT);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].tag, "test.foo");
    assert_eq!(messages[0].field("bar").and_then(Value::as_str), Some("baz"));
    assert!(matches!(messages[0].time, Timestamp::Seconds(_)));
}

#[rstest]
fn events_arrive_in_emit_order(collector: Collector) {
    let sender = sender_for(&collector).build().unwrap();
    for n in 0..50u64 {
        assert!(sender.emit("seq", &BTreeMap::from([("n", n)])).unwrap());
    }
    let messages = collector.wait_for(50, WAIT);
    let seen: Vec<u64> = messages
        .iter()
        .filter_map(|m| m.field("n").and_then(Value::as_u64))
        .collect();
    assert_eq!(seen, (0..50).collect::<Vec<_>>());
}

#[rstest]
fn nanosecond_precision_sends_event_time(collector: Collector) {
    let sender = sender_for(&collector)
        .with_nanosecond_precision(true)
        .build()
        .unwrap();
    sender
        .emit_with_time("nano", 1490061367.8616468906402588_f64, &record(&[("a", "b")]))
        .unwrap();
    let messages = collector.wait_for(1, WAIT);
    let Timestamp::EventTime(time) = messages[0].time else {
        panic!("expected EventTime, got {:?}", messages[0].time);
    };
    assert_eq!(time, EventTime::new(1_490_061_367, 861_646_890));
    assert_eq!(
        time.to_bytes(),
        [0x58, 0xD0, 0x88, 0x37, 0x33, 0x5B, 0xB0, 0x2A]
    );
}

#[rstest]
fn unserialisable_record_is_replaced(collector: Collector) {
    let sender = sender_for(&collector).build().unwrap();
    assert!(sender.emit("bad", &Unserialisable).unwrap());
    let messages = collector.wait_for(1, WAIT);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].tag, "test.bad");
    assert_eq!(
        messages[0].field("message").and_then(Value::as_str),
        Some("Can't output to log")
    );
    assert_eq!(
        messages[0].field("level").and_then(Value::as_str),
        Some("CRITICAL")
    );
    let err = sender.last_error().expect("encoding error recorded");
    assert_eq!(err.kind(), ErrorKind::Encoding);
}

#[rstest]
fn unserialisable_record_errors_without_forwarding(collector: Collector) {
    let sender = sender_for(&collector)
        .with_forward_packet_error(false)
        .build()
        .unwrap();
    let err = sender.emit("bad", &Unserialisable).unwrap_err();
    assert!(matches!(err, SenderError::Encoding { ref tag, .. } if tag == "test.bad"));
    assert!(sender.emit("good", &1).unwrap());
    let messages = collector.wait_for(1, WAIT);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].tag, "test.good");
}

#[rstest]
fn unreachable_collector_is_reported_not_raised(refused_port: u16) {
    let sender = SenderBuilder::new("test")
        .with_host("127.0.0.1")
        .with_port(refused_port)
        .with_timeout_ms(200)
        .build()
        .unwrap();
    sender.clear_last_error();
    assert!(!sender.emit("x", &record(&[("k", "v")])).unwrap());
    let err = sender.last_error().expect("transport error recorded");
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[rstest]
fn batch_carries_every_entry(collector: Collector) {
    let sender = sender_for(&collector).build().unwrap();
    let entries = vec![
        (Timestamp::Seconds(1), record(&[("i", "1")])),
        (Timestamp::Seconds(2), record(&[("i", "2")])),
    ];
    assert!(sender.emit_batch("batch", &entries).unwrap());
    let messages = collector.wait_for(2, WAIT);
    let times: Vec<Timestamp> = messages.iter().map(|m| m.time).collect();
    assert_eq!(times, vec![Timestamp::Seconds(1), Timestamp::Seconds(2)]);
    assert!(messages.iter().all(|m| m.tag == "test.batch"));
}

#[rstest]
fn overflow_handler_receives_discarded_bytes(
    refused_port: u16,
    overflow: (OverflowHandler, Overflowed),
) {
    let (handler, seen) = overflow;
    let sender = SenderBuilder::new("test")
        .with_host("127.0.0.1")
        .with_port(refused_port)
        .with_timeout_ms(200)
        .with_bufmax(16)
        .with_buffer_overflow_handler(move |bytes| handler(bytes))
        .build()
        .unwrap();
    let payload = record(&[("key", "a value longer than the buffer")]);
    assert!(!sender.emit("x", &payload).unwrap());
    let discarded = seen.lock().unwrap().clone();
    assert_eq!(discarded.len(), 1);
    assert!(discarded[0].len() > 16);
}

#[rstest]
fn closed_sender_refuses_events(collector: Collector) {
    let sender = sender_for(&collector).build().unwrap();
    sender.close();
    sender.close();
    assert!(sender.is_closed());
    assert!(!sender.emit("late", &1).unwrap());
}

#[cfg(unix)]
#[rstest]
fn delivers_over_unix_socket() {
    let collector = Collector::start_unix(Default::default());
    let sender = SenderBuilder::new("unix")
        .with_host(collector.host())
        .build()
        .unwrap();
    assert!(sender.emit("path", &record(&[("via", "socket")])).unwrap());
    let messages = collector.wait_for(1, WAIT);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].tag, "unix.path");
}
