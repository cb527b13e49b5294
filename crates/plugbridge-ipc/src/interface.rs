//! A shared memory region holding a fixed set of channels.

use crate::channel::{ChannelSpec, ShmChannel, channel_size};
use crate::shm::SharedMemory;
use plugbridge_plugin::PluginError;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Maximum number of channels in one region
pub const MAX_NUM_CHANNELS: usize = 60;

/// Layout version; the major number must match on both sides
pub const PROTOCOL_VERSION: (u8, u8, u8) = (1, 0, 0);

static REGION_COUNTER: AtomicU32 = AtomicU32::new(0);

#[repr(C)]
struct InterfaceHeader {
    size: u32,
    version: [u8; 4],
    reserved: u32,
    num_channels: u32,
    channel_offset: [u32; MAX_NUM_CHANNELS],
}

const HEADER_SIZE: usize = size_of::<InterfaceHeader>();

const _: () = assert!(HEADER_SIZE % 64 == 0);

/// Shared memory region plus this process' view of its channels
pub struct ShmInterface {
    // channels point into `shm` and must go first
    channels: Vec<ShmChannel>,
    shm: SharedMemory,
}

impl ShmInterface {
    /// Create a new region with the given channels under a unique name
    #[allow(unsafe_code)]
    pub fn create(specs: &[ChannelSpec]) -> Result<Self, PluginError> {
        if specs.len() > MAX_NUM_CHANNELS {
            return Err(PluginError::SystemError(format!(
                "Too many channels: {} (max {MAX_NUM_CHANNELS})",
                specs.len()
            )));
        }

        let mut offsets = Vec::with_capacity(specs.len());
        let mut total = HEADER_SIZE;
        for spec in specs {
            offsets.push(total);
            total += channel_size(spec.capacity);
        }

        // must stay below 31 characters for macOS
        let name = format!(
            "/plugbridge_{}_{}",
            std::process::id(),
            REGION_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let shm = SharedMemory::create(&name, total)?;
        let base = NonNull::new(shm.as_ptr())
            .ok_or_else(|| PluginError::SystemError("null mapping".to_string()))?;

        let mut header = InterfaceHeader {
            size: total as u32,
            version: [
                PROTOCOL_VERSION.0,
                PROTOCOL_VERSION.1,
                PROTOCOL_VERSION.2,
                0,
            ],
            reserved: 0,
            num_channels: specs.len() as u32,
            channel_offset: [0; MAX_NUM_CHANNELS],
        };
        for (slot, &offset) in header.channel_offset.iter_mut().zip(&offsets) {
            *slot = offset as u32;
        }
        // SAFETY: the region is at least HEADER_SIZE bytes and page aligned
        unsafe { base.cast::<InterfaceHeader>().as_ptr().write(header) };

        let channels = specs
            .iter()
            .zip(&offsets)
            // SAFETY: each channel gets its own zeroed, 64 byte aligned block
            .map(|(spec, &offset)| unsafe { ShmChannel::init(base.add(offset), spec) })
            .collect();

        Ok(Self { channels, shm })
    }

    /// Connect to a region created by another process
    #[allow(unsafe_code)]
    pub fn connect(path: &str) -> Result<Self, PluginError> {
        let shm = SharedMemory::open(path)?;
        if shm.size() < HEADER_SIZE {
            return Err(PluginError::SystemError(format!(
                "Shared memory {path} is too small"
            )));
        }
        let base = NonNull::new(shm.as_ptr())
            .ok_or_else(|| PluginError::SystemError("null mapping".to_string()))?;

        // SAFETY: checked above that the header is mapped
        let header = unsafe { base.cast::<InterfaceHeader>().as_ref() };

        if header.version[0] != PROTOCOL_VERSION.0 {
            return Err(PluginError::SystemError(format!(
                "Protocol version mismatch: {}.{}.{} (expected {}.x.x)",
                header.version[0], header.version[1], header.version[2], PROTOCOL_VERSION.0
            )));
        }
        let num_channels = header.num_channels as usize;
        if num_channels > MAX_NUM_CHANNELS {
            return Err(PluginError::SystemError(format!(
                "Bad channel count {num_channels}"
            )));
        }

        let mut channels = Vec::with_capacity(num_channels);
        for (i, &offset) in header.channel_offset[..num_channels].iter().enumerate() {
            let offset = offset as usize;
            let channel = (offset >= HEADER_SIZE && offset < shm.size())
                // SAFETY: offset lies inside the mapping; attach validates the rest
                .then(|| unsafe { ShmChannel::attach(base.add(offset), shm.size() - offset) })
                .flatten()
                .ok_or_else(|| PluginError::SystemError(format!("Channel {i} is corrupt")))?;
            channels.push(channel);
        }

        Ok(Self { channels, shm })
    }

    /// Name of the shared memory object
    pub fn path(&self) -> &str {
        self.shm.name()
    }

    pub fn size(&self) -> usize {
        self.shm.size()
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Get a channel by index.
    ///
    /// Panics on an out-of-range index; channel indices are fixed by the
    /// bridge layout.
    pub(crate) fn channel(&self, index: usize) -> &ShmChannel {
        &self.channels[index]
    }

    pub(crate) fn channels(&self) -> &[ShmChannel] {
        &self.channels
    }

    /// The creating process is gone; unlink the region when we're done
    pub fn set_orphaned(&self) {
        self.shm.set_orphaned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;

    fn specs() -> Vec<ChannelSpec> {
        vec![
            ChannelSpec::queue("ui_snd", 1024),
            ChannelSpec::queue("ui_rcv", 1024),
            ChannelSpec::request("nrt", 4096),
            ChannelSpec::request("rt1", 4096),
        ]
    }

    #[test]
    fn test_create_and_connect() {
        let host = ShmInterface::create(&specs()).unwrap();
        assert!(host.path().starts_with("/plugbridge_"));
        assert!(host.path().len() <= 31);
        assert_eq!(host.num_channels(), 4);

        let child = ShmInterface::connect(host.path()).unwrap();
        assert_eq!(child.size(), host.size());
        assert_eq!(child.num_channels(), 4);
        for (a, b) in host.channels().iter().zip(child.channels()) {
            assert_eq!(a.name(), b.name());
            assert_eq!(a.kind(), b.kind());
            assert_eq!(a.capacity(), b.capacity());
        }
        assert_eq!(child.channel(2).kind(), ChannelKind::Request);

        // messages cross the mapping
        assert!(host.channel(0).write_message(b"open"));
        let mut out = Vec::new();
        assert!(child.channel(0).read_message(&mut out));
        assert_eq!(out, b"open");

        assert!(child.channel(3).add_message(&[1, 2, 3, 4]));
        assert_eq!(host.channel(3).get_message(), Some(&[1, 2, 3, 4][..]));
    }

    #[test]
    fn test_unique_names() {
        let a = ShmInterface::create(&specs()).unwrap();
        let b = ShmInterface::create(&specs()).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_too_many_channels() {
        let specs = vec![ChannelSpec::request("rt", 64); MAX_NUM_CHANNELS + 1];
        assert!(ShmInterface::create(&specs).is_err());
    }

    #[test]
    fn test_connect_to_missing_region() {
        assert!(ShmInterface::connect("/plugbridge_does_not_exist").is_err());
    }
}
