//! This crate provides the Linux backend of `snare-engine`.
//!
//! Processes are enumerated and inspected through procfs, and instrumented
//! with `ptrace(2)`: every thread of an attached process is traced, and
//! function entries are intercepted with software traps.
//!
//! <div class="warning">
//!
//! *This crate is not meant to be used on its own! It merely implements the
//! interface (traits) provided by `snare-engine`, so that processes can be
//! instrumented by that crate.*
//!
//! </div>
//!
//! # Supported Platforms
//!
//! <table>
//!     <thead>
//!         <tr>
//!             <th>Host Machine</th>
//!             <th>Target Platform</th>
//!         </tr>
//!     </thead>
//!     <tbody>
//!         <tr>
//!             <td>Linux <code>x86_64</code></td>
//!             <td><code>x86_64</code> (System V calling convention)</td>
//!         </tr>
//!     </tbody>
//! </table>
//!
//! # Permissions
//!
//! Attaching to a process which isn't a descendant of the caller usually
//! requires `CAP_SYS_PTRACE`, or `kernel.yama.ptrace_scope` set to `0`.
//! Otherwise, attaching fails with
//! [AttachError::PermissionDenied](snare_engine::AttachError::PermissionDenied).

mod sys;

pub use self::sys::{Error, Ptrace, PtraceTarget, Result};
