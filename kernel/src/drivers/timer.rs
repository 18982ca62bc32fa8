//! Timer Hook
//!
//! The clock interrupt of this kernel is delivered cooperatively: a running
//! process calls [`Kernel::clock_interrupt`] (or [`Kernel::time_slice`]) at
//! points where it is safe to be switched out. The hook counts ticks and
//! hands the CPU to the dispatcher once the caller's timeslice is used up.

use tracing::trace;

use crate::Kernel;

impl Kernel {
    /// Clock reading in microseconds
    pub fn current_time(&self) -> u64 {
        self.clock().now_us()
    }

    /// Time at which the caller's current timeslice started
    pub fn read_cur_start_time(&self) -> u64 {
        let (cs, pid) = self.enter("read_cur_start_time");
        let now = cs.now();
        cs.procs[pid].time_slice_start.unwrap_or(now)
    }

    /// CPU time consumed by the caller, including the running slice
    pub fn read_time(&self) -> u64 {
        let (cs, pid) = self.enter("read_time");
        let now = cs.now();
        let pcb = &cs.procs[pid];
        let start = pcb.time_slice_start.unwrap_or(now);
        pcb.cpu_time + now.saturating_sub(start)
    }

    /// Number of clock interrupts delivered so far
    pub fn ticks(&self) -> u64 {
        self.lock().ticks
    }

    /// Re-dispatch if the caller has used up its timeslice
    pub fn time_slice(&self) {
        let (mut cs, pid) = self.enter("time_slice");
        let now = cs.now();
        let start = cs.procs[pid].time_slice_start.unwrap_or(now);

        if now.saturating_sub(start) >= self.config().time_slice_us() {
            trace!("Timeslice of process {} expired after {}us", pid, now - start);
            cs.dispatch();
        }
    }

    /// Clock interrupt entry point
    pub fn clock_interrupt(&self) {
        {
            let (mut cs, _) = self.enter("clock_interrupt");
            cs.ticks = cs.ticks.wrapping_add(1);
        }
        self.time_slice();
    }
}
