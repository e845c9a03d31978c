use d56jit_backend::CodeBuffer;

#[test]
fn test_put_and_read() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    buf.put_u8(0x90);
    buf.put_u32(0xdead_beef);
    assert_eq!(buf.offset(), 5);
    assert_eq!(buf.as_slice()[0], 0x90);
    assert_eq!(buf.read_u32(1), 0xdead_beef);
}

#[test]
fn test_patch() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    buf.put_u32(0);
    buf.patch_u32(0, 0x1234_5678);
    assert_eq!(buf.read_u32(0), 0x1234_5678);
}

#[test]
fn test_truncate_discards_tail() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    buf.put_u64(1);
    let mark = buf.offset();
    buf.put_u64(2);
    buf.truncate(mark);
    assert_eq!(buf.offset(), mark);
    assert_eq!(buf.remaining(), buf.capacity() - mark);
}

#[test]
fn test_size_rounded_to_page() {
    let buf = CodeBuffer::new(1).unwrap();
    assert!(buf.capacity() >= 4096);
    assert_eq!(buf.capacity() % 4096, 0);
}

#[test]
fn test_protection_toggles() {
    let buf = CodeBuffer::new(4096).unwrap();
    buf.protect_exec().unwrap();
    buf.protect_write().unwrap();
}

#[test]
#[should_panic(expected = "code buffer overflow")]
fn test_overflow_asserts() {
    let mut buf = CodeBuffer::new(4096).unwrap();
    for _ in 0..buf.capacity() {
        buf.put_u8(0x90);
    }
    buf.put_u8(0x90);
}
