//! Integration tests: the AFE and DOA elements running inside pipelines.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use gmf_ai_audio::afe::{AfeConfig, AfeElement, AfeEvent, AfeManager, EnergyVadConfig, EnergyVadEngine, Features};
use gmf_ai_audio::doa::{DoaConfig, DoaElement};
use gmf_core::{
    BusReader, BusWriter, DataBus, EventKind, EventPacket, EventState, Pipeline, Task, TaskConfig, Wait, new_ringbuf,
};

fn finished(pipeline: &Pipeline) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    pipeline.set_event(Arc::new(move |evt: &EventPacket| {
        if evt.kind == EventKind::ChangeState && evt.state == EventState::Finished {
            let _ = tx.lock().send(());
        }
    }));
    rx
}

fn drain(bus: &Arc<dyn DataBus>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let (n, last) = bus.read(&mut buf, Wait::ms(500)).unwrap();
        out.extend_from_slice(&buf[..n]);
        if last {
            return out;
        }
    }
}

fn pcm_chunk(level: i16, samples: usize) -> Vec<u8> {
    (0..samples)
        .flat_map(|i| if i % 2 == 0 { level } else { -level }.to_le_bytes())
        .collect()
}

// --- AFE ---

#[test]
fn afe_reports_speech_and_forwards_audio() {
    let engine = EnergyVadEngine::new(&EnergyVadConfig {
        features: Features {
            vad: true,
            ..Features::default()
        },
        ..EnergyVadConfig::default()
    })
    .unwrap();
    let manager = Arc::new(AfeManager::new(Box::new(engine), None).unwrap());
    let afe = AfeElement::new(Arc::clone(&manager), AfeConfig::default());
    let events = afe.handle().event_channel();

    let mut input = Vec::new();
    for _ in 0..10 {
        input.extend(pcm_chunk(0, 512));
    }
    for _ in 0..20 {
        input.extend(pcm_chunk(8000, 512));
    }
    for _ in 0..30 {
        input.extend(pcm_chunk(0, 512));
    }
    let src = new_ringbuf(1, 1 << 16).unwrap();
    let dst = new_ringbuf(1, 1 << 16).unwrap();
    src.write(&input, true, Wait::Immediate).unwrap();

    let mut pipeline = Pipeline::new(
        "afe",
        vec![afe.into_element("ai_afe")],
        Some(Arc::new(BusReader(Arc::clone(&src)))),
        Some(Arc::new(BusWriter(Arc::clone(&dst)))),
    )
    .unwrap();
    pipeline.bind_task(Task::new(TaskConfig::default()).unwrap());
    let done = finished(&pipeline);
    pipeline.loading_jobs().unwrap();
    pipeline.run().unwrap();

    let first = events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, AfeEvent::VadStart);
    let second = events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(second, AfeEvent::VadEnd);

    done.recv_timeout(Duration::from_secs(5)).unwrap();
    let out = drain(&dst);
    assert!(!out.is_empty());
    assert!(out.len() <= input.len());
    assert_eq!(out.len() % 2, 0);
}

// --- DOA ---

/// 4-channel capture whose right microphone lags the left by `delay`.
fn capture(frames: usize, delay: usize) -> Vec<u8> {
    let mut state = 12345u32;
    let voice: Vec<i16> = (0..frames + delay)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            ((state >> 16) as i16) / 4
        })
        .collect();
    let mut out = Vec::with_capacity(frames * 8);
    for n in 0..frames {
        let left = voice[n + delay];
        let right = voice[n];
        for s in [0, left, 0, right] {
            out.extend_from_slice(&s.to_le_bytes());
        }
    }
    out
}

#[test]
fn doa_element_estimates_while_passing_capture_through() {
    let (tx, rx) = unbounded();
    let element = DoaElement::new(&DoaConfig::default(), tx).unwrap();
    let input = capture(256 * 4, 2);
    let src = new_ringbuf(1, 1 << 14).unwrap();
    let dst = new_ringbuf(1, 1 << 14).unwrap();
    src.write(&input, true, Wait::Immediate).unwrap();

    let mut pipeline = Pipeline::new(
        "doa",
        vec![element.into_element("doa")],
        Some(Arc::new(BusReader(Arc::clone(&src)))),
        Some(Arc::new(BusWriter(Arc::clone(&dst)))),
    )
    .unwrap();
    pipeline.bind_task(Task::new(TaskConfig::default()).unwrap());
    let done = finished(&pipeline);
    pipeline.loading_jobs().unwrap();
    pipeline.run().unwrap();
    done.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(drain(&dst), input);
    let angles: Vec<f32> = rx.try_iter().collect();
    assert_eq!(angles.len(), 4);
    assert!(angles.iter().all(|a| *a < 70.0), "{angles:?}");
}
