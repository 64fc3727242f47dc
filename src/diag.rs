//! Allocation-free diagnostic output.
//!
//! The statistics report runs inside `exit(3)` and the free-list dump can
//! run while this crate is the process allocator, so neither may allocate,
//! not even through buffered stdio. [`RawStdout`] therefore hands every
//! formatted chunk straight to `write(2)` on file descriptor 1, the moral
//! equivalent of the classic `setvbuf(stdout, NULL, _IONBF, 0)` trick.
//! `core::fmt` itself formats without allocating.

use std::fmt;

use crate::engine::Stats;

/// Unbuffered writer over file descriptor 1.
pub(crate) struct RawStdout;

impl fmt::Write for RawStdout {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut remaining = s.as_bytes();

        while !remaining.is_empty() {
            let written =
                unsafe { libc::write(1, remaining.as_ptr().cast(), remaining.len() as _) };

            if written <= 0 {
                return Err(fmt::Error);
            }

            remaining = &remaining[written as usize..];
        }

        Ok(())
    }
}

/// Renders the at-exit statistics block: heap size and the call count of
/// each public operation.
pub(crate) fn write_stats(stats: &Stats, out: &mut dyn fmt::Write) -> fmt::Result {
    out.write_str("\n-------------------\n")?;

    writeln!(out, "HeapSize:\t{} bytes", stats.heap_size)?;
    writeln!(out, "# mallocs:\t{}", stats.malloc_calls)?;
    writeln!(out, "# reallocs:\t{}", stats.realloc_calls)?;
    writeln!(out, "# callocs:\t{}", stats.calloc_calls)?;
    writeln!(out, "# frees:\t{}", stats.free_calls)?;

    out.write_str("\n-------------------\n")
}
