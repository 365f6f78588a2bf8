use super::*;
use std::io::Write as _;
use tempfile::tempdir;

#[test]
fn write_then_read_primitives() {
    let mut buf = Buffer::with_capacity(64);
    {
        let mut w = buf.writer();
        w.put_u8(7).unwrap();
        w.put_u32(0xdead_beef).unwrap();
        w.put_u64(u64::MAX).unwrap();
        w.put_i64(-42).unwrap();
        w.put_bytes(b"key").unwrap();
    }
    assert_eq!(buf.limit(), 1 + 4 + 8 + 8 + 3);

    let mut r = buf.reader();
    assert_eq!(r.get_u8().unwrap(), 7);
    assert_eq!(r.get_u32().unwrap(), 0xdead_beef);
    assert_eq!(r.get_u64().unwrap(), u64::MAX);
    assert_eq!(r.get_i64().unwrap(), -42);
    assert_eq!(r.get_bytes(3).unwrap(), b"key");
    assert_eq!(r.remaining(), 0);
}

#[test]
fn varint_roundtrip() {
    let values = [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX];
    let mut buf = Buffer::with_capacity(128);
    {
        let mut w = buf.writer();
        for v in values {
            w.put_var_u64(v).unwrap();
        }
    }
    let mut r = buf.reader();
    for v in values {
        assert_eq!(r.get_var_u64().unwrap(), v);
    }
}

#[test]
fn varint_len_matches_encoding() {
    for v in [0u64, 1, 127, 128, 16_383, 16_384, u64::MAX] {
        let mut buf = Buffer::with_capacity(16);
        buf.writer().put_var_u64(v).unwrap();
        assert_eq!(buf.limit(), var_u64_len(v), "value {v}");
    }
}

#[test]
fn read_past_limit_is_an_error_not_a_panic() {
    let buf = Buffer::from_vec(vec![1, 2, 3]);
    let mut r = buf.reader();
    assert_eq!(r.get_bytes(3).unwrap(), &[1, 2, 3]);
    assert!(r.get_u8().is_err());
    assert!(buf.reader_at(4).is_err());
}

#[test]
fn write_past_capacity_is_an_error() {
    let mut buf = Buffer::with_capacity(4);
    let mut w = buf.writer();
    w.put_u32(1).unwrap();
    assert!(w.put_u8(0).is_err());
}

#[test]
fn writer_at_rewrites_in_place() {
    let mut buf = Buffer::with_capacity(16);
    {
        let mut w = buf.writer();
        w.put_u32(0).unwrap();
        w.put_u32(2).unwrap();
    }
    buf.writer_at(0).unwrap().put_u32(1).unwrap();

    let mut r = buf.reader();
    assert_eq!(r.get_u32().unwrap(), 1);
    assert_eq!(r.get_u32().unwrap(), 2);
    assert_eq!(buf.limit(), 8);
}

#[test]
fn spare_and_set_limit_publish_positioned_io() {
    let mut buf = Buffer::with_capacity(8);
    buf.spare()[..4].copy_from_slice(&[9, 9, 9, 9]);
    buf.set_limit(4).unwrap();
    assert_eq!(buf.as_slice(), &[9, 9, 9, 9]);
    assert!(buf.set_limit(9).is_err());
}

#[test]
fn mapped_file_reads() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("region");
    {
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&42u64.to_le_bytes()).unwrap();
        file.write_all(b"tail").unwrap();
    }

    let mapped = Mapped::open(&path).unwrap();
    assert_eq!(mapped.len(), 12);
    let mut r = mapped.reader_at(0).unwrap();
    assert_eq!(r.get_u64().unwrap(), 42);
    assert_eq!(r.get_bytes(4).unwrap(), b"tail");

    let mut r = mapped.reader_at(8).unwrap();
    assert_eq!(r.get_bytes(4).unwrap(), b"tail");
    assert!(mapped.reader_at(13).is_err());
}

#[test]
fn pool_recycles_buffers() {
    let pool = BufferPool::new(32);
    assert_eq!(pool.idle(), 0);

    {
        let mut one = pool.acquire();
        one.writer().put_u64(1).unwrap();
        assert_eq!(one.limit(), 8);
    }
    assert_eq!(pool.idle(), 1);

    // The recycled buffer comes back cleared.
    let two = pool.acquire();
    assert_eq!(two.limit(), 0);
    assert_eq!(two.capacity(), 32);
    assert_eq!(pool.idle(), 0);
}

#[test]
fn pool_is_shared_across_threads() {
    let pool = BufferPool::new(16);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..100u64 {
                let mut buf = pool.acquire();
                buf.writer().put_u64(i).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(pool.idle() >= 1);
}
