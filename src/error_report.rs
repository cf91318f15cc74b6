//! Rendering failures into the diagnostic stored in `last_error`.

use crate::errors::JobFailure;
use std::backtrace::BacktraceStatus;
use std::error::Error;

/// Render a job failure, its backtrace (when one was captured) and its
/// causes.
pub fn format_failure(failure: &JobFailure) -> String {
    match failure {
        JobFailure::Error(error) => {
            let mut lines = vec![format!("{} {error}", failure.kind())];
            if error.backtrace().status() == BacktraceStatus::Captured {
                lines.push(error.backtrace().to_string());
            }
            let root: &(dyn Error + 'static) = error.as_ref();
            append_causes(&mut lines, root, &mut vec![address(root)]);
            lines.join("\n")
        }
        _ => {
            let mut lines = vec![format!("{} {failure}", failure.kind())];
            append_causes(&mut lines, failure, &mut vec![address(failure)]);
            lines.join("\n")
        }
    }
}

/// Render an error and each distinct cause.
///
/// Every cause is rendered once as `"Caused by:\n<kind> <message>"`.
/// Recursion stops at a cause that is the error itself or that was already
/// rendered further up the chain.
pub fn format_error(error: &(dyn Error + 'static)) -> String {
    let mut lines = vec![format!("{} {error}", error_kind(error))];
    append_causes(&mut lines, error, &mut vec![address(error)]);
    lines.join("\n")
}

fn append_causes(
    lines: &mut Vec<String>,
    error: &(dyn Error + 'static),
    seen: &mut Vec<*const ()>,
) {
    let Some(cause) = error.source() else {
        return;
    };
    let cause_address = address(cause);
    if cause_address == address(error) || seen.contains(&cause_address) {
        return;
    }
    seen.push(cause_address);

    lines.push(format!("Caused by:\n{} {cause}", error_kind(cause)));
    append_causes(lines, cause, seen);
}

fn address(error: &(dyn Error + 'static)) -> *const () {
    std::ptr::from_ref(error).cast::<()>()
}

/// Best-effort name for the kind of error, for the error types this crate
/// commonly sees.
fn error_kind(error: &(dyn Error + 'static)) -> String {
    if let Some(failure) = error.downcast_ref::<JobFailure>() {
        failure.kind().to_string()
    } else if let Some(error) = error.downcast_ref::<std::io::Error>() {
        format!("io::Error({:?})", error.kind())
    } else if error.is::<sqlx::Error>() {
        "sqlx::Error".to_string()
    } else if error.is::<serde_json::Error>() {
        "serde_json::Error".to_string()
    } else if error.is::<tokio::time::error::Elapsed>() {
        "Elapsed".to_string()
    } else {
        "Error".to_string()
    }
}
