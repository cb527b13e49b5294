//! Message channels inside a shared memory region.
//!
//! Every channel starts with a 64 byte header (size, data offset, kind,
//! name and two event words) followed by its data block: the capacity, the
//! number of bytes currently in use and the message bytes themselves.
//!
//! A message is a `u32` payload length followed by the payload, padded so
//! that the next message starts on an 8 byte boundary.
//!
//! * `Queue` channels are ring buffers with wrap-around. Messages are copied
//!   in and out. They carry UI traffic, one writer process and one reader
//!   process each.
//! * `Request` channels are linear. The client appends messages in place,
//!   posts event A and waits on event B; the server reads the request in
//!   place, writes its reply into the same buffer and posts event B.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Size of the channel header in bytes
pub const CHANNEL_HEADER_SIZE: usize = 64;

/// Maximum length of a channel name, including the terminating NUL
pub const MAX_CHANNEL_NAME: usize = 20;

const MESSAGE_HEADER_SIZE: usize = size_of::<u32>();
const MESSAGE_ALIGNMENT: usize = 8;

pub(crate) const fn align_to(n: usize, alignment: usize) -> usize {
    n.div_ceil(alignment) * alignment
}

/// Bytes a message with `payload` bytes occupies in a channel
pub const fn message_size(payload: usize) -> usize {
    align_to(MESSAGE_HEADER_SIZE + payload, MESSAGE_ALIGNMENT)
}

/// Total bytes a channel with the given capacity occupies
pub const fn channel_size(capacity: usize) -> usize {
    align_to(
        CHANNEL_HEADER_SIZE + size_of::<ChannelData>() + align_to(capacity, MESSAGE_ALIGNMENT),
        CHANNEL_HEADER_SIZE,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelKind {
    Queue = 0,
    Request = 1,
}

impl ChannelKind {
    fn from_u32(val: u32) -> Option<Self> {
        match val {
            0 => Some(Self::Queue),
            1 => Some(Self::Request),
            _ => None,
        }
    }
}

#[repr(C)]
struct ChannelHeader {
    size: u32,
    offset: u32,
    kind: u32,
    name: [u8; MAX_CHANNEL_NAME],
    event_a: AtomicU32,
    event_b: AtomicU32,
    padding: [u8; 24],
}

const _: () = assert!(size_of::<ChannelHeader>() == CHANNEL_HEADER_SIZE);

#[repr(C)]
struct ChannelData {
    capacity: u32,
    size: AtomicU32,
}

/// Description of a channel to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub kind: ChannelKind,
    pub capacity: usize,
    pub name: String,
}

impl ChannelSpec {
    pub fn queue(name: &str, capacity: usize) -> Self {
        Self {
            kind: ChannelKind::Queue,
            capacity,
            name: name.to_string(),
        }
    }

    pub fn request(name: &str, capacity: usize) -> Self {
        Self {
            kind: ChannelKind::Request,
            capacity,
            name: name.to_string(),
        }
    }
}

/// This process' view of one channel
///
/// Read and write heads are local to the process; only the used size and
/// the event words are shared. The methods that touch the message buffer
/// are crate-private: outside of this crate a request channel is only
/// reachable through the lock guard in [`crate::bridge::Channel`].
pub struct ShmChannel {
    header: NonNull<ChannelHeader>,
    data: NonNull<ChannelData>,
    buffer: NonNull<u8>,
    capacity: usize,
    kind: ChannelKind,
    name: String,
    rdhead: AtomicUsize,
    wrhead: AtomicUsize,
}

// The shared fields are atomics; the buffer is accessed under the channel
// protocol (one writer, one reader, or request/reply hand-over).
#[allow(unsafe_code)]
unsafe impl Send for ShmChannel {}
#[allow(unsafe_code)]
unsafe impl Sync for ShmChannel {}

impl ShmChannel {
    /// Write a fresh channel header at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to `channel_size(spec.capacity)` zeroed, writable
    /// bytes aligned to 64 that stay mapped for the lifetime of the channel.
    #[allow(unsafe_code)]
    pub(crate) unsafe fn init(base: NonNull<u8>, spec: &ChannelSpec) -> Self {
        let capacity = align_to(spec.capacity, MESSAGE_ALIGNMENT);
        let mut name = [0u8; MAX_CHANNEL_NAME];
        let mut len = spec.name.len().min(MAX_CHANNEL_NAME - 1);
        while !spec.name.is_char_boundary(len) {
            len -= 1;
        }
        name[..len].copy_from_slice(&spec.name.as_bytes()[..len]);

        let header = base.cast::<ChannelHeader>();
        // SAFETY: guaranteed by the caller
        unsafe {
            header.as_ptr().write(ChannelHeader {
                size: channel_size(capacity) as u32,
                offset: CHANNEL_HEADER_SIZE as u32,
                kind: spec.kind as u32,
                name,
                event_a: AtomicU32::new(0),
                event_b: AtomicU32::new(0),
                padding: [0; 24],
            });
            let data = base.add(CHANNEL_HEADER_SIZE).cast::<ChannelData>();
            data.as_ptr().write(ChannelData {
                capacity: capacity as u32,
                size: AtomicU32::new(0),
            });
        }

        // SAFETY: the header was just written
        unsafe { Self::from_header(base, spec.kind, spec.name[..len].to_string(), capacity) }
    }

    /// Attach to a channel written by the other side.
    ///
    /// # Safety
    ///
    /// `base` must point to `available` mapped bytes aligned to 64 that stay
    /// mapped for the lifetime of the channel.
    #[allow(unsafe_code)]
    pub(crate) unsafe fn attach(base: NonNull<u8>, available: usize) -> Option<Self> {
        if available < CHANNEL_HEADER_SIZE + size_of::<ChannelData>() {
            return None;
        }
        // SAFETY: at least a header is mapped
        let (size, offset, kind, name) = unsafe {
            let header = &*base.cast::<ChannelHeader>().as_ptr();
            (
                header.size as usize,
                header.offset as usize,
                header.kind,
                header.name,
            )
        };
        let kind = ChannelKind::from_u32(kind)?;
        if offset != CHANNEL_HEADER_SIZE || size > available {
            return None;
        }

        // SAFETY: the data block follows the header inside `size` bytes
        let capacity = unsafe {
            base.add(offset)
                .cast::<ChannelData>()
                .as_ref()
                .capacity as usize
        };
        if size < channel_size(capacity) || capacity % MESSAGE_ALIGNMENT != 0 {
            return None;
        }
        let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        let name = String::from_utf8_lossy(&name[..len]).into_owned();

        // SAFETY: layout validated above
        Some(unsafe { Self::from_header(base, kind, name, capacity) })
    }

    #[allow(unsafe_code)]
    unsafe fn from_header(base: NonNull<u8>, kind: ChannelKind, name: String, capacity: usize) -> Self {
        // SAFETY: guaranteed by the callers
        unsafe {
            let data = base.add(CHANNEL_HEADER_SIZE);
            Self {
                header: base.cast(),
                data: data.cast(),
                buffer: data.add(size_of::<ChannelData>()),
                capacity,
                kind,
                name,
                rdhead: AtomicUsize::new(0),
                wrhead: AtomicUsize::new(0),
            }
        }
    }

    #[allow(unsafe_code)]
    fn header(&self) -> &ChannelHeader {
        // SAFETY: the mapping outlives `self`
        unsafe { self.header.as_ref() }
    }

    #[allow(unsafe_code)]
    fn used(&self) -> &AtomicU32 {
        // SAFETY: the mapping outlives `self`
        unsafe { &self.data.as_ref().size }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity of the message buffer in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently in use
    pub fn size(&self) -> usize {
        self.used().load(Ordering::Acquire) as usize
    }

    /// Whether a message with `payload` bytes would fit right now
    pub fn fits(&self, payload: usize) -> bool {
        self.capacity - self.size() >= message_size(payload)
    }

    /// Empty the channel and rewind both heads
    pub(crate) fn clear(&self) {
        self.used().store(0, Ordering::Release);
        self.rdhead.store(0, Ordering::Relaxed);
        self.wrhead.store(0, Ordering::Relaxed);
    }

    /// Rewind the read head of a request channel
    pub(crate) fn reset(&self) {
        self.rdhead.store(0, Ordering::Relaxed);
    }

    #[allow(unsafe_code)]
    fn read_u32(&self, pos: usize) -> u32 {
        debug_assert!(pos + MESSAGE_HEADER_SIZE <= self.capacity);
        // SAFETY: pos is 8 byte aligned and inside the buffer
        unsafe { self.buffer.add(pos).cast::<u32>().as_ptr().read_volatile() }
    }

    #[allow(unsafe_code)]
    fn write_u32(&self, pos: usize, val: u32) {
        debug_assert!(pos + MESSAGE_HEADER_SIZE <= self.capacity);
        // SAFETY: pos is 8 byte aligned and inside the buffer
        unsafe { self.buffer.add(pos).cast::<u32>().as_ptr().write_volatile(val) }
    }

    /// Copy `data` into the ring buffer starting at `pos`, wrapping around
    #[allow(unsafe_code)]
    fn copy_in(&self, pos: usize, data: &[u8]) {
        let first = data.len().min(self.capacity - pos);
        // SAFETY: both ranges are inside the buffer
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.buffer.add(pos).as_ptr(), first);
            std::ptr::copy_nonoverlapping(
                data.as_ptr().add(first),
                self.buffer.as_ptr(),
                data.len() - first,
            );
        }
    }

    #[allow(unsafe_code)]
    fn copy_out(&self, pos: usize, out: &mut [u8]) {
        let first = out.len().min(self.capacity - pos);
        // SAFETY: both ranges are inside the buffer
        unsafe {
            std::ptr::copy_nonoverlapping(self.buffer.add(pos).as_ptr(), out.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(
                self.buffer.as_ptr(),
                out.as_mut_ptr().add(first),
                out.len() - first,
            );
        }
    }

    /// Append a message to a queue channel.
    ///
    /// Returns `false` without touching the channel if it doesn't fit.
    pub(crate) fn write_message(&self, data: &[u8]) -> bool {
        debug_assert_eq!(self.kind, ChannelKind::Queue);
        let total = message_size(data.len());
        if self.capacity - self.size() < total {
            return false;
        }
        let wr = self.wrhead.load(Ordering::Relaxed);
        self.write_u32(wr, data.len() as u32);
        self.copy_in((wr + MESSAGE_HEADER_SIZE) % self.capacity, data);
        self.wrhead
            .store((wr + total) % self.capacity, Ordering::Relaxed);
        self.used().fetch_add(total as u32, Ordering::Release);
        true
    }

    /// Take the next message from a queue channel.
    ///
    /// Returns `false` if the queue is empty.
    pub(crate) fn read_message(&self, out: &mut Vec<u8>) -> bool {
        debug_assert_eq!(self.kind, ChannelKind::Queue);
        if self.size() == 0 {
            return false;
        }
        let rd = self.rdhead.load(Ordering::Relaxed);
        let len = (self.read_u32(rd) as usize).min(self.capacity - MESSAGE_HEADER_SIZE);
        out.clear();
        out.resize(len, 0);
        self.copy_out((rd + MESSAGE_HEADER_SIZE) % self.capacity, out);
        let total = message_size(len);
        self.rdhead
            .store((rd + total) % self.capacity, Ordering::Relaxed);
        self.used().fetch_sub(total as u32, Ordering::Release);
        true
    }

    /// Append a message of `len` bytes to a request channel, letting `fill`
    /// write the payload in place.
    ///
    /// Returns `false` without touching the channel if the message doesn't
    /// fit or `fill` returns `false`.
    #[allow(unsafe_code)]
    pub(crate) fn add_message_with(&self, len: usize, fill: impl FnOnce(&mut [u8]) -> bool) -> bool {
        debug_assert_eq!(self.kind, ChannelKind::Request);
        let used = self.used().load(Ordering::Relaxed) as usize;
        let total = message_size(len);
        if self.capacity - used < total {
            return false;
        }
        // SAFETY: the range is inside the buffer and past everything written
        // so far; only the holder of the channel writes here
        let payload = unsafe {
            std::slice::from_raw_parts_mut(
                self.buffer.add(used + MESSAGE_HEADER_SIZE).as_ptr(),
                len,
            )
        };
        if !fill(payload) {
            return false;
        }
        self.write_u32(used, len as u32);
        self.used().store((used + total) as u32, Ordering::Release);
        true
    }

    /// Append a copy of `data` to a request channel
    pub(crate) fn add_message(&self, data: &[u8]) -> bool {
        self.add_message_with(data.len(), |buf| {
            buf.copy_from_slice(data);
            true
        })
    }

    /// Read the next message of a request channel in place.
    ///
    /// The slice stays valid until the next `clear` or `add_message*` on
    /// this channel; callers hold the channel lock for as long as they
    /// use it.
    #[allow(unsafe_code)]
    pub(crate) fn get_message(&self) -> Option<&[u8]> {
        debug_assert_eq!(self.kind, ChannelKind::Request);
        let rd = self.rdhead.load(Ordering::Relaxed);
        if rd >= self.size() {
            return None;
        }
        let len = self.read_u32(rd) as usize;
        let start = rd + MESSAGE_HEADER_SIZE;
        if start + len > self.capacity {
            tracing::error!("{}: corrupt message of {} bytes at {}", self.name, len, rd);
            return None;
        }
        self.rdhead.store(rd + message_size(len), Ordering::Relaxed);
        // SAFETY: the range is inside the buffer and was written before the
        // event that handed us the channel
        Some(unsafe { std::slice::from_raw_parts(self.buffer.add(start).as_ptr(), len) })
    }

    /// Signal a request
    pub fn post(&self) {
        futex::post(&self.header().event_a);
    }

    /// Wait for a request
    pub fn wait(&self) {
        futex::wait(&self.header().event_a);
    }

    /// Signal the reply
    pub fn post_reply(&self) {
        futex::post(&self.header().event_b);
    }

    /// Wait for the reply
    pub fn wait_reply(&self) {
        futex::wait(&self.header().event_b);
    }

    /// Wait for the reply at most `timeout`. Returns `false` on timeout.
    pub fn wait_reply_timeout(&self, timeout: Duration) -> bool {
        futex::wait_timeout(&self.header().event_b, timeout)
    }
}

/// Binary events living in shared memory.
///
/// `post` sets the word to 1, `wait` blocks until it can flip it back to 0.
/// Each event has at most one waiter.
#[cfg(target_os = "linux")]
mod futex {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    #[allow(unsafe_code)]
    pub fn wait(word: &AtomicU32) {
        loop {
            if word
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            // SAFETY: the word lives in shared memory for as long as we wait
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    word.as_ptr(),
                    libc::FUTEX_WAIT,
                    0u32,
                    std::ptr::null::<libc::timespec>(),
                )
            };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN | libc::EINTR) => {}
                    _ => {
                        tracing::error!("futex wait failed: {}", err);
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    #[allow(unsafe_code)]
    pub fn wait_timeout(word: &AtomicU32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if word
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let ts = libc::timespec {
                tv_sec: remaining.as_secs() as libc::time_t,
                tv_nsec: remaining.subsec_nanos() as libc::c_long,
            };
            // SAFETY: see `wait`; the timeout is relative
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    word.as_ptr(),
                    libc::FUTEX_WAIT,
                    0u32,
                    &raw const ts,
                )
            };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN | libc::EINTR | libc::ETIMEDOUT) => {}
                    _ => {
                        tracing::error!("futex wait failed: {}", err);
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    #[allow(unsafe_code)]
    pub fn post(word: &AtomicU32) {
        if word
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // SAFETY: see `wait`
            let ret = unsafe { libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, 1) };
            if ret < 0 {
                tracing::error!("futex wake failed: {}", std::io::Error::last_os_error());
            }
        }
    }
}

/// Polling fallback for systems without futexes
#[cfg(not(target_os = "linux"))]
mod futex {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    const SPIN_COUNT: u32 = 1000;
    const POLL_INTERVAL: Duration = Duration::from_micros(50);

    pub fn wait(word: &AtomicU32) {
        let mut spins = 0;
        while word
            .compare_exchange_weak(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if spins < SPIN_COUNT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }

    pub fn wait_timeout(word: &AtomicU32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while word
            .compare_exchange_weak(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        true
    }

    pub fn post(word: &AtomicU32) {
        let _ = word.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::sync::Arc;

    /// A channel over private heap memory, standing in for a mapping
    struct TestChannel {
        base: NonNull<u8>,
        layout: Layout,
        channel: ShmChannel,
    }

    #[allow(unsafe_code)]
    unsafe impl Send for TestChannel {}
    #[allow(unsafe_code)]
    unsafe impl Sync for TestChannel {}

    impl TestChannel {
        #[allow(unsafe_code)]
        fn new(spec: &ChannelSpec) -> Self {
            let layout = Layout::from_size_align(channel_size(spec.capacity), 64).unwrap();
            let base = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
            let channel = unsafe { ShmChannel::init(base, spec) };
            Self {
                base,
                layout,
                channel,
            }
        }

        #[allow(unsafe_code)]
        fn attach(&self) -> ShmChannel {
            unsafe { ShmChannel::attach(self.base, self.layout.size()) }.unwrap()
        }
    }

    impl Drop for TestChannel {
        #[allow(unsafe_code)]
        fn drop(&mut self) {
            unsafe { dealloc(self.base.as_ptr(), self.layout) };
        }
    }

    #[test]
    fn test_layout() {
        assert_eq!(message_size(0), 8);
        assert_eq!(message_size(4), 8);
        assert_eq!(message_size(5), 16);
        assert_eq!(channel_size(1024), 1152);
        assert_eq!(channel_size(1000) % 64, 0);
    }

    #[test]
    fn test_attach_sees_same_channel() {
        let test = TestChannel::new(&ChannelSpec::request("nrt", 256));
        let other = test.attach();
        assert_eq!(other.name(), "nrt");
        assert_eq!(other.kind(), ChannelKind::Request);
        assert_eq!(other.capacity(), 256);

        assert!(test.channel.add_message(b"hello"));
        assert_eq!(other.get_message(), Some(&b"hello"[..]));
        assert_eq!(other.get_message(), None);
    }

    #[test]
    fn test_long_names_are_truncated() {
        let test = TestChannel::new(&ChannelSpec::queue("a_rather_long_channel_name", 64));
        assert_eq!(test.channel.name().len(), MAX_CHANNEL_NAME - 1);
        assert_eq!(test.attach().name(), test.channel.name());
    }

    #[test]
    fn test_request_messages_in_order() {
        let test = TestChannel::new(&ChannelSpec::request("rt", 256));
        let chn = &test.channel;
        assert!(chn.add_message(&[1, 2, 3]));
        assert!(chn.add_message(&[]));
        assert!(chn.add_message(&[4; 9]));

        assert_eq!(chn.get_message(), Some(&[1, 2, 3][..]));
        assert_eq!(chn.get_message(), Some(&[][..]));
        assert_eq!(chn.get_message(), Some(&[4; 9][..]));
        assert_eq!(chn.get_message(), None);

        chn.reset();
        assert_eq!(chn.get_message(), Some(&[1, 2, 3][..]));

        chn.clear();
        assert_eq!(chn.size(), 0);
        assert_eq!(chn.get_message(), None);
    }

    #[test]
    fn test_rejected_message_leaves_channel_untouched() {
        let test = TestChannel::new(&ChannelSpec::request("rt", 64));
        let chn = &test.channel;
        assert!(chn.add_message(&[7; 20]));
        let size = chn.size();

        assert!(!chn.fits(64));
        assert!(!chn.add_message(&[8; 64]));
        assert_eq!(chn.size(), size);

        // a failing writer doesn't commit anything either
        assert!(!chn.add_message_with(4, |_| false));
        assert_eq!(chn.size(), size);

        assert_eq!(chn.get_message(), Some(&[7; 20][..]));
        assert_eq!(chn.get_message(), None);
    }

    #[test]
    fn test_queue_wraps_around() {
        let test = TestChannel::new(&ChannelSpec::queue("ui", 64));
        let writer = &test.channel;
        let reader = test.attach();
        let mut out = Vec::new();

        // 24 bytes per message; the third write wraps the payload
        for round in 0u8..10 {
            let msg = [round; 20];
            assert!(writer.write_message(&msg));
            assert!(writer.write_message(&msg));
            assert!(!writer.write_message(&msg));

            assert!(reader.read_message(&mut out));
            assert_eq!(out, msg);
            assert!(reader.read_message(&mut out));
            assert_eq!(out, msg);
            assert!(!reader.read_message(&mut out));
        }
    }

    #[test]
    fn test_request_reply_events() {
        let test = Arc::new(TestChannel::new(&ChannelSpec::request("rt", 256)));

        let server = {
            let test = Arc::clone(&test);
            std::thread::spawn(move || {
                let chn = test.attach();
                for _ in 0..100 {
                    chn.wait();
                    let request = chn.get_message().unwrap().to_vec();
                    chn.clear();
                    let reply: Vec<u8> = request.iter().map(|b| b + 1).collect();
                    assert!(chn.add_message(&reply));
                    chn.post_reply();
                }
            })
        };

        let chn = &test.channel;
        for i in 0u8..100 {
            chn.clear();
            assert!(chn.add_message(&[i, i]));
            chn.post();
            chn.wait_reply();
            assert_eq!(chn.get_message(), Some(&[i + 1, i + 1][..]));
        }
        server.join().unwrap();
    }

    #[test]
    fn test_reply_wait_times_out() {
        let test = TestChannel::new(&ChannelSpec::request("nrt", 64));
        let chn = &test.channel;

        let start = std::time::Instant::now();
        assert!(!chn.wait_reply_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));

        chn.post_reply();
        assert!(chn.wait_reply_timeout(Duration::from_millis(50)));
        // the event was consumed
        assert!(!chn.wait_reply_timeout(Duration::from_millis(1)));
    }
}
