//! Call stack extraction
//!
//! Frames come from a `std::backtrace::Backtrace` rendered as text, either one
//! captured together with an error ([`CapturedError`]) or one captured at the
//! current execution point. Both paths report frames innermost-first.
//!
//! Toolchain and dependency frames are dropped, as are frames with a synthetic
//! location, so the agent only sees code the host application owns. Builds
//! without line tables print no locations at all; those frames are judged by
//! symbol name instead.

use std::backtrace::Backtrace;

use crate::context::CapturedError;
use crate::protocol::StackFrame;

/// Path fragments that mark a frame as toolchain or dependency code
const INTERNAL_PATH_MARKERS: &[&str] = &[
    "/rustc/",
    "/library/std/",
    "/library/core/",
    "/library/alloc/",
    "/.cargo/registry/",
    "/.cargo/git/",
    "/.rustup/",
];

/// Symbol prefixes that mark an unlocated frame as toolchain or runtime code
const INTERNAL_SYMBOL_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "test::",
    "tokio::",
    "futures_util::",
    "futures_core::",
];

/// Frames of [`CapturedError`]'s own capture methods
const CAPTURE_SYMBOL_PREFIX: &str = concat!(env!("CARGO_CRATE_NAME"), "::context::value::CapturedError::");

/// Extract the call stack for an invocation
///
/// With an error that carries a captured trace, the trace is walked from the
/// point the error was captured and `skip_frames` is ignored. Otherwise the
/// live stack is captured and the first `skip_frames` frames (innermost,
/// after filtering) are discarded.
pub fn extract_call_stack(error: Option<&CapturedError>, skip_frames: usize) -> Vec<StackFrame> {
    if let Some(trace) = error.and_then(|e| e.trace()) {
        return filter_frames(parse_backtrace(trace))
            .into_iter()
            .skip_while(|frame| frame.function_name.starts_with(CAPTURE_SYMBOL_PREFIX))
            .collect();
    }
    capture_current(skip_frames)
}

/// Capture the live stack at the current point
#[inline(never)]
pub fn capture_current(skip_frames: usize) -> Vec<StackFrame> {
    let trace = Backtrace::force_capture().to_string();
    filter_frames(parse_backtrace(&trace))
        .into_iter()
        .skip(skip_frames)
        .collect()
}

/// Capture the live stack as seen by the caller of this crate
///
/// Leading frames that belong to this crate are dropped first, then
/// `skip_frames` more.
#[inline(never)]
pub(crate) fn caller_frames(skip_frames: usize) -> Vec<StackFrame> {
    let crate_prefix = concat!(env!("CARGO_CRATE_NAME"), "::");
    capture_current(0)
        .into_iter()
        .skip_while(|frame| frame.function_name.starts_with(crate_prefix))
        .skip(skip_frames)
        .collect()
}

/// Parse the text form of a backtrace into raw frames
///
/// The expected shape is the one `Backtrace`'s `Display` produces:
///
/// ```text
///    3: my_app::handler
///              at ./src/handler.rs:42:9
/// ```
///
/// Symbols without an `at` line keep an empty path.
pub fn parse_backtrace(text: &str) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = Vec::new();
    let mut pending_location = false;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with("note:") {
            continue;
        }

        if let Some(location) = line.strip_prefix("at ") {
            if let (true, Some(frame)) = (pending_location, frames.last_mut()) {
                let (file, line_no, column) = split_location(location);
                frame.file_path = file;
                frame.line = line_no;
                frame.column = column;
            }
            pending_location = false;
            continue;
        }

        let name = match line.split_once(": ") {
            Some((index, rest)) if index.chars().all(|c| c.is_ascii_digit()) => rest,
            _ => line,
        };
        frames.push(StackFrame {
            file_path: String::new(),
            line: 0,
            column: 0,
            function_name: name.to_string(),
        });
        pending_location = true;
    }

    frames
}

/// Split `path:line:column` (line and column optional) from the right
fn split_location(location: &str) -> (String, u32, u32) {
    let mut parts = location.rsplitn(3, ':');
    let last = parts.next().unwrap_or_default();
    let middle = parts.next();
    let rest = parts.next();

    match (rest, middle) {
        (Some(path), Some(line)) => match (line.parse(), last.parse()) {
            (Ok(l), Ok(c)) => (path.to_string(), l, c),
            _ => (location.to_string(), 0, 0),
        },
        (None, Some(path)) => match last.parse() {
            Ok(l) => (path.to_string(), l, 0),
            Err(_) => (location.to_string(), 0, 0),
        },
        _ => (location.to_string(), 0, 0),
    }
}

/// Whether a frame belongs to the toolchain or a dependency, or has a synthetic location
pub fn is_internal_frame(frame: &StackFrame) -> bool {
    if frame.file_path.is_empty() {
        return is_internal_symbol(&frame.function_name);
    }
    let path = frame.file_path.replace('\\', "/");
    if path.starts_with('<') {
        return true;
    }
    INTERNAL_PATH_MARKERS.iter().any(|marker| path.contains(marker))
}

/// Unlocated symbols: runtime prefixes, and bare C names such as `main` or `_start`
///
/// `<Type as Trait>::method` is judged by `Type`, or by `Trait` when `Type` is
/// a bare generic parameter like `F`.
fn is_internal_symbol(name: &str) -> bool {
    if name.is_empty() || name == "<unknown>" || !name.contains("::") {
        return true;
    }
    let owner = match name.strip_prefix('<').and_then(|inner| inner.split_once(" as ")) {
        Some((self_type, trait_path)) if !self_type.contains("::") => trait_path,
        Some((self_type, _)) => self_type,
        None => name.trim_start_matches('<'),
    };
    INTERNAL_SYMBOL_PREFIXES.iter().any(|prefix| owner.starts_with(prefix))
}

fn filter_frames(frames: Vec<StackFrame>) -> Vec<StackFrame> {
    frames
        .into_iter()
        .filter(|frame| !is_internal_frame(frame))
        .collect()
}

/// Render frames in backtrace style, one frame per entry
pub fn format_frames(frames: &[StackFrame]) -> String {
    let mut out = String::new();
    for (index, frame) in frames.iter().enumerate() {
        out.push_str(&format!(
            "{:4}: {}\n             at {}:{}:{}\n",
            index, frame.function_name, frame.file_path, frame.line, frame.column
        ));
    }
    out
}
