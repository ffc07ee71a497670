//! Outbound scheduler command stream
//!
//! The engine never reads back what it emits: commands go into a
//! [`CommandSink`] in the exact order they must be executed, and firmware
//! consumes them FIFO. Every word is little-endian on the wire, whatever
//! the host byte order.

/// Destination of finished scheduler commands
pub trait CommandSink {
    /// Append one complete command. Appended bytes are committed.
    fn append_command(&mut self, bytes: &[u8]);

    /// Append one complete command given as dwords
    fn append_dwords(&mut self, dwords: &[u32]) {
        let le: Vec<u32> = dwords.iter().map(|w| w.to_le()).collect();
        self.append_command(bytemuck::cast_slice(&le));
    }
}

/// Contiguous byte buffer, e.g. a staging area copied to device memory
impl CommandSink for Vec<u8> {
    fn append_command(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// In-memory sink that keeps command boundaries
#[derive(Debug, Clone, Default)]
pub struct CommandStream {
    commands: Vec<Vec<u8>>,
}

impl CommandStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands in emission order
    pub fn commands(&self) -> &[Vec<u8>] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.commands.iter().map(Vec::len).sum()
    }

    /// Command `index` decoded back into dwords
    pub fn command_dwords(&self, index: usize) -> Option<Vec<u32>> {
        self.commands.get(index).map(|bytes| decode_dwords(bytes))
    }

    /// Every command decoded into dwords
    pub fn dwords(&self) -> Vec<Vec<u32>> {
        self.commands.iter().map(|c| decode_dwords(c)).collect()
    }

    /// Drain the recorded commands
    pub fn take(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.commands)
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

impl CommandSink for CommandStream {
    fn append_command(&mut self, bytes: &[u8]) {
        log::trace!("command #{}: {} bytes", self.commands.len(), bytes.len());
        self.commands.push(bytes.to_vec());
    }
}

fn decode_dwords(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
