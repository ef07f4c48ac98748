//! Recovers the real program's arguments when a service wrapper launched us.
//!
//! Wrappers such as `mono-service` pass themselves as argv[0], followed by their own
//! flags and then the real executable. Argument parsers further up only want what comes
//! after the real executable.
use tracing::debug;

use crate::constants::{SERVICE_WRAPPER_NAMES, WRAPPER_FLAG_PREFIX};

/// Normalizes `raw` using the built-in wrapper names.
pub fn normalize(raw: &str, args: &[String]) -> String {
    normalize_with(raw, args, SERVICE_WRAPPER_NAMES)
}

/// Returns the part of `raw` that belongs to the real program when `args[0]` names one
/// of `wrappers`; otherwise returns `raw` untouched.
pub fn normalize_with(raw: &str, args: &[String], wrappers: &[&str]) -> String {
    let Some(wrapper) = args.first() else {
        return raw.to_string();
    };

    if !wrappers.iter().any(|name| wrapper.ends_with(name)) {
        return raw.to_string();
    }

    let remaining = after_token(raw, wrapper).unwrap_or(raw).trim_start();

    let Some(real_exe) = args[1..]
        .iter()
        .find(|arg| !arg.starts_with(WRAPPER_FLAG_PREFIX))
    else {
        debug!("No executable follows wrapper '{wrapper}' in the command line");
        return remaining.trim().to_string();
    };

    match after_token(remaining, real_exe) {
        Some(tail) => tail.trim().to_string(),
        None => {
            debug!("Executable '{real_exe}' not found in command line; keeping remainder");
            remaining.trim().to_string()
        }
    }
}

/// Text following the first occurrence of `token`, preferring a quoted occurrence.
fn after_token<'a>(text: &'a str, token: &str) -> Option<&'a str> {
    let quoted = format!("\"{token}\"");
    if let Some(index) = text.find(&quoted) {
        return Some(&text[index + quoted.len()..]);
    }

    text.find(token).map(|index| &text[index + token.len()..])
}

/// Rebuilds a single command-line string from an argument vector, quoting arguments
/// that contain whitespace.
pub fn join_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                format!("\"{arg}\"")
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// The current process's command line as seen by the real program.
pub fn unparsed_command_line() -> String {
    let args: Vec<String> = std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    normalize(&join_args(&args), &args)
}
