//! Agent CLI stream handling.
//!
//! The agent speaks newline-delimited JSON ("stream-json") on stdout and, in
//! the streaming strategy, accepts the same framing on stdin.
//!
//! - `codec`: line framing with a 1 MiB cap.
//! - `parser`: one output line → zero or more session events.
//! - `process`: spawning, output forwarding, stdin writing, and kill plumbing.

pub mod codec;
pub mod parser;
pub mod process;
