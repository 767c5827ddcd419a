//! Cross-thread pipeline behavior: chunked capture off a descriptor, FIFO
//! hand-off between stages, and shutdown flowing upstream to downstream
//! within the time budget.

use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use voz::features::AUDIO_BUFFER_SIZE;
use voz::input::{InputConfig, InputProcessor};
use voz::rollbuf::SyncRollBuffer;
use voz::CHUNK_SIZE;

const CHUNK_BYTES: usize = CHUNK_SIZE * 2;

#[test]
fn stop_joins_all_stages_within_a_second() {
    let (rd, wr) = nix::unistd::pipe().unwrap();
    let mut writer = unsafe { std::fs::File::from_raw_fd(wr) };

    // 16 chunks fit comfortably inside the pipe buffer, so the feed never
    // blocks and the descriptor stays open afterwards
    let fed_chunks = 16usize;
    let payload = vec![0x11u8; CHUNK_BYTES];
    for _ in 0..fed_chunks {
        writer.write_all(&payload).unwrap();
    }

    let audio = Arc::new(SyncRollBuffer::<i16>::new(AUDIO_BUFFER_SIZE, false));
    let cleaned = Arc::new(SyncRollBuffer::<i16>::new(AUDIO_BUFFER_SIZE, false));

    let capture = InputProcessor::new(InputConfig::default(), Arc::clone(&audio));
    let control = capture.control();
    let capture_handle = std::thread::spawn(move || capture.run(rd));

    // relay stage: drains the audio buffer into the next one, forwarding
    // cancel the way the feature stage does
    let relay_in = Arc::clone(&audio);
    let relay_out = Arc::clone(&cleaned);
    let relay_handle = std::thread::spawn(move || loop {
        let mut guard = relay_in.wait_at_least(CHUNK_SIZE);
        let status = guard.status();
        let staged: Vec<i16> = guard.get().to_vec();
        guard.shift(staged.len());
        guard.release();
        if !staged.is_empty() {
            relay_out.append(&staged);
        }
        if status.cancel {
            relay_out.cancel();
            break;
        }
    });

    let consumed = Arc::new(AtomicUsize::new(0));
    let consumed_in_thread = Arc::clone(&consumed);
    let sink_in = Arc::clone(&cleaned);
    let sink_handle = std::thread::spawn(move || loop {
        let mut guard = sink_in.wait_any();
        let status = guard.status();
        let got = guard.len();
        guard.shift(got);
        guard.release();
        consumed_in_thread.fetch_add(got, Ordering::Relaxed);
        if status.cancel {
            break;
        }
    });

    // wait until everything fed has flowed through both buffers
    let deadline = Instant::now() + Duration::from_secs(5);
    while consumed.load(Ordering::Relaxed) < fed_chunks * CHUNK_SIZE {
        assert!(Instant::now() < deadline, "pipeline stalled");
        std::thread::sleep(Duration::from_millis(5));
    }

    control.stop();
    let begun = Instant::now();
    capture_handle.join().unwrap();
    relay_handle.join().unwrap();
    sink_handle.join().unwrap();
    assert!(
        begun.elapsed() < Duration::from_secs(1),
        "stages took {:?} to join",
        begun.elapsed()
    );
    assert_eq!(consumed.load(Ordering::Relaxed), fed_chunks * CHUNK_SIZE);

    drop(writer);
    nix::unistd::close(rd).unwrap();
}

#[test]
fn eof_cancels_the_whole_chain() {
    let (rd, wr) = nix::unistd::pipe().unwrap();
    let mut writer = unsafe { std::fs::File::from_raw_fd(wr) };
    writer.write_all(&vec![0u8; 3 * CHUNK_BYTES]).unwrap();
    drop(writer); // EOF

    let audio = Arc::new(SyncRollBuffer::<i16>::new(AUDIO_BUFFER_SIZE, false));
    let capture = InputProcessor::new(InputConfig::default(), Arc::clone(&audio));
    capture.run(rd);

    let guard = audio.wait_any();
    assert!(guard.status().cancel);
    assert_eq!(guard.len(), 3 * CHUNK_SIZE);
    guard.release();
    nix::unistd::close(rd).unwrap();
}

#[test]
fn reset_discards_inflight_audio_but_keeps_the_stream() {
    let audio = Arc::new(SyncRollBuffer::<i16>::new(AUDIO_BUFFER_SIZE, false));
    audio.append(&vec![7i16; CHUNK_SIZE]);
    audio.reset();
    audio.reset(); // idempotent

    let guard = audio.wait_any();
    assert!(guard.status().reset);
    assert!(!guard.status().cancel);
    assert_eq!(guard.len(), 0);
    guard.release_and_signal();
    assert!(!audio.status().reset);

    // the stream keeps flowing after the acknowledge
    audio.append(&vec![9i16; CHUNK_SIZE]);
    assert_eq!(audio.len(), CHUNK_SIZE);
}
