//! The HLE kernel: object arena, handle table and guest threads.

pub mod object;
pub mod thread;

pub use object::{Handle, HandleTable, KernelObject};
pub use thread::{GuestThread, ThreadId, ThreadManager, ThreadState};

use crate::memory::MemorySystem;
use crate::result::{ErrorLevel, ErrorModule, ErrorSummary, ResultCode};
use crate::types::{PAddr, CMD_BUFFER_OFFSET, CMD_BUFFER_WORDS, TLS_BLOCK_SIZE};

/// Result code returned when a kernel resource pool is exhausted.
pub fn err_out_of_resource() -> ResultCode {
    ResultCode::new(
        10,
        ErrorModule::Kernel,
        ErrorSummary::OutOfResource,
        ErrorLevel::Permanent,
    )
}

pub struct Kernel {
    pub threads: ThreadManager,
    pub handles: HandleTable,
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            threads: ThreadManager::new(),
            handles: HandleTable::new(),
        }
    }

    /// Create a guest thread, carving its TLS block (which contains the
    /// IPC command buffer) out of the System region.
    pub fn spawn_thread(
        &mut self,
        memory: &mut MemorySystem,
        name: impl Into<String>,
        entry: PAddr,
    ) -> Result<ThreadId, ResultCode> {
        let tls_addr = memory
            .system
            .linear_allocate(TLS_BLOCK_SIZE)
            .ok_or_else(err_out_of_resource)?;
        Ok(self.threads.spawn(name, entry, tls_addr))
    }

    /// Physical address of `thread`'s IPC command buffer.
    pub fn cmd_buffer_addr(&self, thread: ThreadId) -> PAddr {
        self.threads.get(thread).tls_addr + CMD_BUFFER_OFFSET
    }

    /// Copy `thread`'s command buffer out of guest memory.
    pub fn read_cmd_buffer(
        &self,
        memory: &MemorySystem,
        thread: ThreadId,
    ) -> [u32; CMD_BUFFER_WORDS] {
        let base = self.cmd_buffer_addr(thread);
        let mut words = [0u32; CMD_BUFFER_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = memory.read_u32(base + i as u32 * 4);
        }
        words
    }

    /// Write the leading `words` of `thread`'s command buffer.
    pub fn write_cmd_words(&self, memory: &mut MemorySystem, thread: ThreadId, words: &[u32]) {
        assert!(
            words.len() <= CMD_BUFFER_WORDS,
            "{} words do not fit the {CMD_BUFFER_WORDS}-word command buffer",
            words.len()
        );
        let base = self.cmd_buffer_addr(thread);
        for (i, &word) in words.iter().enumerate() {
            memory.write_u32(base + i as u32 * 4, word);
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMode;

    #[test]
    fn spawned_threads_get_distinct_tls_blocks() {
        let mut memory = MemorySystem::new(MemoryMode::Prod);
        let mut kernel = Kernel::new();

        let a = kernel.spawn_thread(&mut memory, "a", 0x10_0000).unwrap();
        let b = kernel.spawn_thread(&mut memory, "b", 0x10_0000).unwrap();

        let tls_a = kernel.threads.get(a).tls_addr;
        let tls_b = kernel.threads.get(b).tls_addr;
        assert_ne!(tls_a, tls_b);
        assert_eq!(memory.system.used(), 2 * TLS_BLOCK_SIZE);
    }

    #[test]
    fn command_buffer_round_trips_through_guest_memory() {
        let mut memory = MemorySystem::new(MemoryMode::Prod);
        let mut kernel = Kernel::new();
        let t = kernel.spawn_thread(&mut memory, "main", 0).unwrap();

        kernel.write_cmd_words(&mut memory, t, &[0x0001_0040, 0xDEAD_BEEF]);
        let words = kernel.read_cmd_buffer(&memory, t);
        assert_eq!(words[0], 0x0001_0040);
        assert_eq!(words[1], 0xDEAD_BEEF);
        assert_eq!(words[2], 0);
    }
}
