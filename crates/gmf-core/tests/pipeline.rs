//! Integration tests: pipelines built from the pool running on a task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use gmf_core::{
    EventKind, EventPacket, EventState, IoResult, Payload, Pipeline, PortIo, Pool, Task, TaskConfig, Wait,
    new_ringbuf,
};

fn event_channel(pipeline: &Pipeline) -> mpsc::Receiver<EventPacket> {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    pipeline.set_event(Arc::new(move |evt: &EventPacket| {
        let _ = tx.lock().unwrap().send(evt.clone());
    }));
    rx
}

fn wait_for_state(rx: &mpsc::Receiver<EventPacket>, want: EventState) -> Vec<EventState> {
    let mut seen = Vec::new();
    loop {
        let evt = rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or_else(|_| panic!("no {want} event, saw {seen:?}"));
        if evt.kind == EventKind::ChangeState {
            seen.push(evt.state);
            if evt.state == want {
                return seen;
            }
        }
    }
}

// --- end-to-end stream ---

#[test]
fn copy_and_framer_move_a_stream_between_rings() {
    let src = new_ringbuf(1, 8192).unwrap();
    let dst = new_ringbuf(1, 8192).unwrap();
    let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    src.write(&data, true, Wait::Immediate).unwrap();

    let mut pool = Pool::with_builtin();
    pool.register_bus_io("src", Arc::clone(&src));
    pool.register_bus_io("dst", Arc::clone(&dst));
    let mut pipeline = pool.new_pipeline(Some("src"), &["copy", "framer"], Some("dst")).unwrap();
    pipeline.bind_task(Task::new(TaskConfig::default()).unwrap());
    let rx = event_channel(&pipeline);

    pipeline.loading_jobs().unwrap();
    pipeline.run().unwrap();
    let states = wait_for_state(&rx, EventState::Finished);
    assert_eq!(states.first(), Some(&EventState::Opening));
    assert!(states.contains(&EventState::Running));
    assert_eq!(pipeline.state(), EventState::Finished);

    let mut out = Vec::new();
    let mut buf = [0u8; 700];
    loop {
        let (n, last) = dst.read(&mut buf, Wait::ms(500)).unwrap();
        out.extend_from_slice(&buf[..n]);
        if last {
            break;
        }
    }
    assert_eq!(out, data);
}

#[test]
fn pipeline_runs_again_after_reset() {
    let src = new_ringbuf(1, 4096).unwrap();
    let dst = new_ringbuf(1, 4096).unwrap();
    let mut pool = Pool::with_builtin();
    pool.register_bus_io("src", Arc::clone(&src));
    pool.register_bus_io("dst", Arc::clone(&dst));
    let mut pipeline = pool.new_pipeline(Some("src"), &["copy"], Some("dst")).unwrap();
    pipeline.bind_task(Task::new(TaskConfig::default()).unwrap());
    let rx = event_channel(&pipeline);

    for round in 0..2u8 {
        src.reset();
        dst.reset();
        src.write(&[round; 300], true, Wait::Immediate).unwrap();
        pipeline.loading_jobs().unwrap();
        pipeline.run().unwrap();
        wait_for_state(&rx, EventState::Finished);
        assert_eq!(pipeline.state(), EventState::Finished);
        // Let the worker go idle before resetting.
        thread::sleep(Duration::from_millis(20));

        let mut buf = [0u8; 512];
        let (n, _) = dst.read(&mut buf, Wait::ms(500)).unwrap();
        assert_eq!(&buf[..n], &[round; 300][..]);
        pipeline.reset();
        assert_eq!(pipeline.state(), EventState::None);
    }
}

#[test]
fn state_is_current_when_its_event_arrives() {
    let src = new_ringbuf(1, 1024).unwrap();
    let dst = new_ringbuf(1, 1024).unwrap();
    let mut pool = Pool::with_builtin();
    pool.register_bus_io("src", Arc::clone(&src));
    pool.register_bus_io("dst", Arc::clone(&dst));
    let mut pipeline = pool.new_pipeline(Some("src"), &["copy"], Some("dst")).unwrap();
    pipeline.bind_task(Task::new(TaskConfig::default()).unwrap());
    let rx = event_channel(&pipeline);

    for round in 0..20u8 {
        src.reset();
        dst.reset();
        src.write(&[round; 64], true, Wait::Immediate).unwrap();
        pipeline.loading_jobs().unwrap();
        pipeline.run().unwrap();
        wait_for_state(&rx, EventState::Finished);
        assert_eq!(pipeline.state(), EventState::Finished, "round {round}");
        thread::sleep(Duration::from_millis(20));
        pipeline.reset();
    }
}

// --- control ---

/// Endless source producing a fixed byte pattern.
struct Tone;

impl PortIo for Tone {
    fn name(&self) -> &str {
        "tone"
    }

    fn acquire(&self, load: &mut Payload, wanted: usize, _wait: Wait) -> IoResult<()> {
        thread::sleep(Duration::from_millis(1));
        load.buf_mut()[..wanted].fill(0x5a);
        load.set_valid_size(wanted).map_err(|_| gmf_core::IoError::Fail)
    }

    fn release(&self, _load: &mut Payload, _wait: Wait) -> IoResult<()> {
        Ok(())
    }
}

/// Sink counting the bytes it is handed.
#[derive(Clone, Default)]
struct Counter(Arc<AtomicUsize>);

impl PortIo for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn acquire(&self, _load: &mut Payload, _wanted: usize, _wait: Wait) -> IoResult<()> {
        Ok(())
    }

    fn release(&self, load: &mut Payload, _wait: Wait) -> IoResult<()> {
        self.0.fetch_add(load.valid_size(), Ordering::Relaxed);
        Ok(())
    }
}

#[test]
fn pause_resume_and_stop_an_endless_stream() {
    let counter = Counter::default();
    let pool = Pool::with_builtin();
    let mut pipeline = pool
        .new_pipeline_with(Some(Arc::new(Tone)), &["copy", "gain"], Some(Arc::new(counter.clone())))
        .unwrap();
    pipeline.bind_task(Task::new(TaskConfig::default()).unwrap());
    let rx = event_channel(&pipeline);

    pipeline.loading_jobs().unwrap();
    pipeline.run().unwrap();
    wait_for_state(&rx, EventState::Running);
    thread::sleep(Duration::from_millis(20));

    pipeline.pause().unwrap();
    assert_eq!(pipeline.state(), EventState::Paused);
    let frozen = counter.0.load(Ordering::Relaxed);
    assert!(frozen > 0);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(counter.0.load(Ordering::Relaxed), frozen);

    pipeline.resume().unwrap();
    assert_eq!(pipeline.state(), EventState::Running);
    thread::sleep(Duration::from_millis(20));

    pipeline.stop().unwrap();
    assert_eq!(pipeline.state(), EventState::Stopped);
    assert!(counter.0.load(Ordering::Relaxed) > frozen);
}

#[test]
fn gain_is_adjustable_through_its_method() {
    use gmf_core::{ArgValue, MethodArgs};

    let pool = Pool::with_builtin();
    let pipeline = pool.new_pipeline_with(None, &["gain"], None).unwrap();
    let mut args = pipeline.with_element("gain", |el| el.methods()[0].args()).unwrap();
    args.set("db", ArgValue::F32(-6.0)).unwrap();
    pipeline.exec_method("gain", "set_gain", &args).unwrap();
    assert!(pipeline.exec_method("gain", "set_pan", &MethodArgs::default()).is_err());
}
