// =============================================================================
// Telemetry — append-only JSONL emission and file tailing
// =============================================================================
//
// Workers append one JSON object per line to run-scoped files; the control
// plane tails those files and fans lines out to live subscribers. The file is
// the contract: single writer, many readers, best-effort delivery.
// =============================================================================

pub mod tail;
pub mod writer;

pub use tail::{tail_jsonl, TailFrame, TailOptions};
pub use writer::TelemetryWriter;
