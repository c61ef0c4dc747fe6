//! Producer/consumer hand-off across two mappings of one segment.

use std::sync::mpsc;
use std::thread;

use vox_buffer::{BufferHandle, BufferReader, SharedDoubleBuffer};
use vox_core::{Frame, FrameShape, PixelType};

const SHAPE: FrameShape = FrameShape::new(16, 8);

#[test]
fn batches_arrive_in_order_with_exact_contents() {
    let dir = tempfile::tempdir().unwrap();
    let depth = 4;
    let total: u16 = 10;
    let buffer = SharedDoubleBuffer::allocate(SHAPE, depth, PixelType::U16, Some(dir.path())).unwrap();

    // The handle travels as JSON, as it would to a worker process
    let json = serde_json::to_string(buffer.handle()).unwrap();

    let (batch_tx, batch_rx) = mpsc::channel::<(u32, usize)>();
    let (release_tx, release_rx) = mpsc::channel::<u64>();

    let consumer = thread::spawn(move || {
        let handle: BufferHandle = serde_json::from_str(&json).unwrap();
        let reader = BufferReader::open(&handle).unwrap();
        let mut seen = Vec::new();
        let mut released = 0u64;
        for (region, valid_depth) in batch_rx {
            {
                let view = reader.batch(region, valid_depth).unwrap();
                for frame in view.frames() {
                    let pixels: &[u16] = bytemuck::cast_slice(frame);
                    assert!(pixels.iter().all(|&p| p == pixels[0]));
                    seen.push(pixels[0]);
                }
            }
            released += 1;
            reader.publish_progress(released, seen.len() as u64, seen.len() as f64 / 10.0);
            release_tx.send(released).unwrap();
        }
        seen
    });

    let mut dispatched = 0u64;
    let mut released = 0u64;
    for value in 0..total {
        let frame = Frame::filled(SHAPE, PixelType::U16, f64::from(value));
        let slot = buffer.add_frame(&frame).unwrap();
        if slot + 1 == depth || value + 1 == total {
            // Backpressure: the consumer must release everything dispatched so far
            while released < dispatched {
                released = release_rx.recv().unwrap();
            }
            let ticket = buffer.toggle().unwrap();
            assert_eq!(ticket.swap_index, dispatched);
            batch_tx.send((ticket.region, ticket.valid_depth)).unwrap();
            dispatched += 1;
        }
    }
    drop(batch_tx);

    let seen = consumer.join().unwrap();
    assert_eq!(seen, (0..total).collect::<Vec<_>>());

    let progress = buffer.progress().unwrap();
    assert_eq!(progress.batches_released, 3);
    assert_eq!(progress.frames_processed, 10);
    assert!((progress.progress - 1.0).abs() < 1e-9);
}

#[test]
fn reader_cannot_touch_the_write_region() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = SharedDoubleBuffer::allocate(SHAPE, 2, PixelType::U8, Some(dir.path())).unwrap();
    let reader = BufferReader::open(buffer.handle()).unwrap();

    for _ in 0..5 {
        buffer
            .add_frame(&Frame::filled(SHAPE, PixelType::U8, 1.0))
            .unwrap();
        let write_region = buffer.write_region();
        assert_eq!(reader.write_region(), write_region);
        assert!(reader.batch(write_region, 1).is_err());

        let ticket = buffer.toggle().unwrap();
        assert_ne!(ticket.region, buffer.write_region());
        assert_eq!(reader.read_valid_depth(), 1);
        assert!(reader.batch(ticket.region, ticket.valid_depth).is_ok());
    }
}

#[test]
fn released_segment_cannot_be_opened() {
    let dir = tempfile::tempdir().unwrap();
    let mut buffer = SharedDoubleBuffer::allocate(SHAPE, 2, PixelType::U16, Some(dir.path())).unwrap();
    let handle = buffer.handle().clone();
    buffer.close_and_release();
    assert!(BufferReader::open(&handle).is_err());
}
