//! FFI implementation details.

use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr};

use tracing::{debug, error, info, trace, warn, Level};

use llama_cpp_sys::ggml_log_level;

thread_local! {
    /// The unfinished line llama.cpp is writing on this thread, if any.
    static PENDING_LINE: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Forwards llama.cpp and GGML log lines to `tracing` under the `llama.cpp` target.
///
/// llama.cpp often writes one line across several calls, so text is buffered per thread until
/// its newline arrives.
pub(crate) unsafe extern "C" fn llama_log_callback(
    level: ggml_log_level,
    text: *const c_char,
    _user_data: *mut c_void,
) {
    if text.is_null() {
        return;
    }

    let text = unsafe {
        // SAFETY: `text` is a non-null, NUL-terminated C String.
        CStr::from_ptr(text)
    };
    let text = String::from_utf8_lossy(text.to_bytes());
    let level = tracing_level(level);

    PENDING_LINE.with(|pending| {
        for line in complete_lines(&mut pending.borrow_mut(), &text) {
            emit(level, &line);
        }
    });
}

/// Maps a native log level onto `tracing`. With `sys_verbosity`, DEBUG and INFO move down a step.
fn tracing_level(level: ggml_log_level) -> Level {
    match level {
        ggml_log_level::GGML_LOG_LEVEL_ERROR => Level::ERROR,
        ggml_log_level::GGML_LOG_LEVEL_WARN => Level::WARN,
        #[cfg(not(feature = "sys_verbosity"))]
        ggml_log_level::GGML_LOG_LEVEL_INFO => Level::INFO,
        #[cfg(not(feature = "sys_verbosity"))]
        ggml_log_level::GGML_LOG_LEVEL_DEBUG => Level::DEBUG,
        #[cfg(feature = "sys_verbosity")]
        ggml_log_level::GGML_LOG_LEVEL_INFO => Level::DEBUG,
        #[allow(unreachable_patterns)]
        _ => Level::TRACE,
    }
}

fn emit(level: Level, line: &str) {
    if level == Level::ERROR {
        error!(target: "llama.cpp", "{line}");
    } else if level == Level::WARN {
        warn!(target: "llama.cpp", "{line}");
    } else if level == Level::INFO {
        info!(target: "llama.cpp", "{line}");
    } else if level == Level::DEBUG {
        debug!(target: "llama.cpp", "{line}");
    } else {
        trace!(target: "llama.cpp", "{line}");
    }
}

/// Appends `text` to `pending` and takes out every line it completes.
///
/// Blank lines and progress dots are dropped.
fn complete_lines(pending: &mut String, text: &str) -> Vec<String> {
    pending.push_str(text);

    let mut lines = vec![];
    while let Some(end) = pending.find('\n') {
        let line: String = pending.drain(..=end).collect();
        let line = line.trim_end();

        if !line.is_empty() && !line.chars().all(|c| c == '.') {
            lines.push(line.to_owned());
        }
    }

    lines
}
