//! Traps, exceptions and interrupts.
//!
//! - `vectors`: the shared vector table and per-CPU task state
//! - `frame`: the captured register frame and its diagnostic dump
//! - `dispatch`: the trap dispatcher and its terminal actions
//! - `routes`: trap number to handler mapping
//! - `page_fault`: page fault handling and user fault delivery

pub mod dispatch;
pub mod frame;
pub mod page_fault;
pub mod routes;
pub mod vectors;

pub use dispatch::TerminalAction;
pub use frame::{print_trapframe, trapname, CapturedFrame, Origin};
pub use routes::{Flow, TrapHandler, ROUTES};
pub use vectors::{init_percpu, PerCpuContext, VectorTable};
