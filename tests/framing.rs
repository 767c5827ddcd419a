//! Wire-protocol scenarios: resynchronisation on garbage, streamed frames,
//! and the catalog round trip a host configuration change goes through.

use std::fs::File;

use voz::error::{FrameFormatKind, VozError};
use voz::serial::event::{AudioConfPayload, StatusPayload, WwConfPayload};
use voz::serial::{encode, Catalog, Event, FrameReader};

#[test]
fn garbage_then_status_parses_exactly_once() {
    let mut stream = vec![0xEEu8; 32]; // no SOH anywhere
    stream.extend_from_slice(&encode(&Event::Status(StatusPayload {
        mode: 1,
        error_kind: 0,
        ready: 1,
        frames_in: 42,
        frames_dropped: 0,
        ww_mask: 0b1,
    })));

    let mut reader = FrameReader::new();
    reader.push(&stream);

    // the reader reports the resync once, then parses cleanly
    assert!(matches!(
        reader.next_event(),
        Err(VozError::FrameFormat(FrameFormatKind::NoSoh))
    ));
    match reader.next_event() {
        Ok(Some(Event::Status(p))) => {
            assert_eq!(p.frames_in, 42);
            assert_eq!(p.ww_mask, 0b1);
        }
        other => panic!("expected a status event, got {:?}", other.map(|_| ())),
    }
    assert_eq!(reader.pending(), 0);
    assert!(reader.next_event().unwrap().is_none());
}

#[test]
fn several_frames_in_one_push_come_out_in_order() {
    let events = vec![
        Event::Mode(1),
        Event::Config(AudioConfPayload {
            preamp: 2.0,
            noiser: 2,
            autogain: 3,
            vad: 1,
        }),
        Event::Audio(vec![0xAB; 2 * 1280]),
        Event::Areset(2),
    ];
    let mut stream = Vec::new();
    for ev in &events {
        stream.extend_from_slice(&encode(ev));
    }

    let mut reader = FrameReader::new();
    // feed in awkward slices to exercise partial-frame buffering
    for piece in stream.chunks(17) {
        reader.push(piece);
    }
    let mut got = Vec::new();
    loop {
        match reader.next_event() {
            Ok(Some(ev)) => got.push(ev),
            Ok(None) => break,
            Err(e) => panic!("unexpected reject: {}", e),
        }
    }
    assert_eq!(got, events);
    assert!(reader.at_eof().is_ok());
}

#[test]
fn ww_conf_frame_drives_catalog_and_echo() {
    let dir = tempfile::tempdir().unwrap();
    File::create(dir.path().join("alpha.tflite")).unwrap();
    File::create(dir.path().join("beta.tflite")).unwrap();
    let mut catalog = Catalog::scan(dir.path()).unwrap();
    assert_eq!(catalog.mask(), 0b01);

    // host enables entry 1 with its own tuning, over the wire
    let conf = WwConfPayload {
        index: 1,
        enabled: 1,
        threshold: 0.6,
        patience: 2,
    };
    let mut reader = FrameReader::new();
    reader.push(&encode(&Event::WwConf(conf)));
    let event = reader.next_event().unwrap().unwrap();
    let decoded = match event {
        Event::WwConf(c) => c,
        other => panic!("expected WwConf, got {:?}", other),
    };
    catalog.apply_conf(&decoded).unwrap();

    // mask now carries both entries and the echo reflects the update
    assert_eq!(catalog.mask(), 0b11);
    let echo = catalog.status_payload(1).unwrap();
    assert_eq!(echo.name_str(), "beta");
    assert_eq!(echo.conf.enabled, 1);
    assert_eq!(echo.conf.threshold, 0.6);
    assert_eq!(echo.conf.patience, 2);

    // the echo frame itself survives the wire
    let mut reader = FrameReader::new();
    reader.push(&encode(&Event::WwStatus(echo)));
    match reader.next_event().unwrap().unwrap() {
        Event::WwStatus(back) => assert_eq!(back.name_str(), "beta"),
        other => panic!("expected WwStatus, got {:?}", other),
    }

    // and the next child launch carries the new entry
    let args = catalog.model_args();
    assert_eq!(args.len(), 2);
    assert!(args[1].ends_with("beta.tflite:1:0.6:2"));
}
