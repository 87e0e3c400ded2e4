//! Pooled buffers, their input stream, the growable output stream, and the
//! buffer factory.

use imgpool_core::config::PoolParams;
use imgpool_core::memory::NoOpMemoryTrimmableRegistry;
use imgpool_mem::{
    Error, GenericByteArrayPool, NativeMemoryChunkPool, NoOpPoolStatsTracker, PeakUsageTracker,
    PooledBufferFactory, PooledBufferOutputStream, PooledByteStreams,
};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

fn chunk_pool(tracker: Arc<PeakUsageTracker>) -> Arc<NativeMemoryChunkPool> {
    let buckets = [(16, 4), (32, 4), (64, 4), (128, 4)].into_iter().collect();
    let params = PoolParams::with_caps(4096, 8192, Some(buckets)).expect("Invalid params");
    NativeMemoryChunkPool::new(params, &NoOpMemoryTrimmableRegistry, tracker)
        .expect("Pool creation failed")
}

fn buffer_factory() -> PooledBufferFactory {
    let pool = chunk_pool(Arc::new(PeakUsageTracker::new()));
    let params = PoolParams::with_caps(64, 1024, Some([(8, 2)].into_iter().collect()))
        .expect("Invalid params");
    let arrays = GenericByteArrayPool::new(
        params,
        &NoOpMemoryTrimmableRegistry,
        Arc::new(NoOpPoolStatsTracker),
    )
    .expect("Pool creation failed");
    let streams = PooledByteStreams::with_temp_buf_size(arrays, 8).expect("Streams failed");
    PooledBufferFactory::new(pool, streams)
}

#[test]
fn test_output_stream_grows_with_single_realloc() {
    let tracker = Arc::new(PeakUsageTracker::new());
    let pool = chunk_pool(tracker.clone());

    let mut out = PooledBufferOutputStream::new(pool.clone()).expect("Stream creation failed");
    assert_eq!(out.capacity().expect("Stream closed"), 16);
    assert_eq!(tracker.alloc_count(), 1);

    let first: Vec<u8> = (0..10).collect();
    out.write_all(&first).expect("Write failed");
    assert_eq!(tracker.alloc_count(), 1);

    // 10 + 30 = 40 bytes no longer fit in 16: one realloc straight to 64.
    let second: Vec<u8> = (100..130).collect();
    out.write_all(&second).expect("Write failed");
    assert_eq!(tracker.alloc_count(), 2);
    assert_eq!(out.capacity().expect("Stream closed"), 64);
    assert_eq!(out.size(), 40);

    let buffer = out.to_byte_buffer().expect("Snapshot failed");
    assert_eq!(buffer.size().expect("Buffer closed"), 40);
    let bytes = buffer.to_vec().expect("Read failed");
    assert_eq!(&bytes[..10], &first[..]);
    assert_eq!(&bytes[10..], &second[..]);

    // The old 16-byte chunk went back to the pool.
    assert_eq!(pool.free_counter().num_bytes, 16);
}

#[test]
fn test_buffer_outlives_stream_and_returns_chunk() {
    let pool = chunk_pool(Arc::new(PeakUsageTracker::new()));

    let mut out = PooledBufferOutputStream::with_capacity(pool.clone(), 32).expect("Stream creation failed");
    out.write_all(b"pooled").expect("Write failed");
    let buffer = out.to_byte_buffer().expect("Snapshot failed");
    out.close();
    assert!(out.is_closed());
    assert_eq!(pool.in_use_count(), 1);

    assert_eq!(buffer.to_vec().expect("Read failed"), b"pooled".to_vec());
    assert_eq!(buffer.read_byte(5).expect("Read failed"), b'd');

    drop(buffer);
    assert_eq!(pool.in_use_count(), 0);
    assert_eq!(pool.free_counter().num_bytes, 32);
}

#[test]
fn test_closed_stream_and_buffer_fail() {
    let pool = chunk_pool(Arc::new(PeakUsageTracker::new()));

    let mut out = PooledBufferOutputStream::new(pool.clone()).expect("Stream creation failed");
    out.write_all(b"abc").expect("Write failed");
    let buffer = out.to_byte_buffer().expect("Snapshot failed");
    out.close();

    assert!(matches!(out.write_bytes(b"x"), Err(Error::InvalidStream)));
    assert!(matches!(out.to_byte_buffer(), Err(Error::InvalidStream)));

    buffer.close();
    assert!(buffer.is_closed());
    assert!(matches!(buffer.size(), Err(Error::Closed)));
    let mut dst = [0u8; 1];
    assert!(matches!(buffer.read(0, &mut dst), Err(Error::Closed)));
}

#[test]
fn test_input_stream_read_and_seek() {
    let factory = buffer_factory();
    let buffer = factory.from_bytes(b"0123456789").expect("Buffer creation failed");

    let mut reader = buffer.reader().expect("Reader failed");
    let mut four = [0u8; 4];
    reader.read_exact(&mut four).expect("Read failed");
    assert_eq!(&four, b"0123");

    reader.seek(SeekFrom::Current(2)).expect("Seek failed");
    reader.read_exact(&mut four).expect("Read failed");
    assert_eq!(&four, b"6789");
    assert_eq!(reader.remaining(), 0);

    assert_eq!(reader.seek(SeekFrom::End(-3)).expect("Seek failed"), 7);
    let mut rest = String::new();
    reader.read_to_string(&mut rest).expect("Read failed");
    assert_eq!(rest, "789");

    assert_eq!(reader.seek(SeekFrom::Current(-100)).expect("Seek failed"), 0);
    assert_eq!(reader.seek(SeekFrom::Start(100)).expect("Seek failed"), 10);
}

#[test]
fn test_factory_from_reader_copies_everything() {
    let factory = buffer_factory();
    let data: Vec<u8> = (0..300u32).map(|i| (i * 7 % 256) as u8).collect();

    let buffer = factory
        .from_reader(&mut Cursor::new(&data))
        .expect("Buffer creation failed");
    assert_eq!(buffer.size().expect("Buffer closed"), 300);
    assert_eq!(buffer.to_vec().expect("Read failed"), data);

    let sized = factory
        .from_reader_with_capacity(&mut Cursor::new(&data[..20]), 128)
        .expect("Buffer creation failed");
    assert_eq!(sized.size().expect("Buffer closed"), 20);

    let empty = factory
        .from_reader(&mut Cursor::new(Vec::<u8>::new()))
        .expect("Buffer creation failed");
    assert_eq!(empty.size().expect("Buffer closed"), 0);
}

#[test]
fn test_new_byte_buffer_is_exact_size() {
    let factory = buffer_factory();
    let buffer = factory.new_byte_buffer(20).expect("Buffer creation failed");
    assert_eq!(buffer.size().expect("Buffer closed"), 20);
    let mut dst = [0u8; 21];
    assert!(buffer.read(0, &mut dst).is_err());
    assert!(buffer.read(0, &mut dst[..20]).is_ok());
    assert_eq!(factory.pool().in_use_count(), 1);
}

#[test]
fn test_byte_streams_copy_n_into_output_stream() {
    let factory = buffer_factory();
    let params = PoolParams::with_caps(64, 1024, Some([(8, 2)].into_iter().collect()))
        .expect("Invalid params");
    let arrays = GenericByteArrayPool::new(
        params,
        &NoOpMemoryTrimmableRegistry,
        Arc::new(NoOpPoolStatsTracker),
    )
    .expect("Pool creation failed");
    let streams = PooledByteStreams::with_temp_buf_size(arrays.clone(), 8).expect("Streams failed");

    let data: Vec<u8> = (0..50).collect();
    let mut out = factory.new_output_stream().expect("Stream creation failed");
    let copied = streams
        .copy_n(&mut Cursor::new(&data), &mut out, 33)
        .expect("Copy failed");
    assert_eq!(copied, 33);
    out.flush().expect("Flush failed");

    let buffer = out.to_byte_buffer().expect("Snapshot failed");
    assert_eq!(buffer.to_vec().expect("Read failed"), data[..33].to_vec());
    assert_eq!(arrays.used_counter().count, 0);
}
