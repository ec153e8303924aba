//! Environment sanitisation for child processes.
//!
//! Tool subprocesses inherit a scrubbed environment: variables that can
//! inject code into arbitrary programs (loader preloads, interpreter startup
//! hooks, option smuggling) are removed, and only a whitelist of known-safe
//! variables passes through.

use std::collections::HashMap;

/// Variables preserved verbatim when present.
const SAFE_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "SHELL", "TERM", "LANG", "TZ", "TMPDIR", "PWD",
    "HOSTNAME", "EDITOR", "PAGER", "COLUMNS", "LINES",
];

/// Prefixes preserved when present (locale family).
const SAFE_PREFIXES: &[&str] = &["LC_"];

/// Exact names that must never reach a child, even if something upstream
/// put them on the safe list by mistake.
const INJECTION_VARS: &[&str] = &[
    "BASH_ENV", "ENV", "IFS", "CDPATH", "GLOBIGNORE", "SHELLOPTS", "BASHOPTS",
    "PERL5OPT", "PERLLIB", "RUBYOPT", "RUBYLIB", "NODE_OPTIONS", "NODE_PATH",
    "JAVA_TOOL_OPTIONS", "_JAVA_OPTIONS", "SSH_AUTH_SOCK", "SSH_AGENT_PID",
    "HTTP_PROXY", "HTTPS_PROXY", "FTP_PROXY", "ALL_PROXY", "NO_PROXY",
    "http_proxy", "https_proxy", "ftp_proxy", "all_proxy", "no_proxy",
];

/// Prefixes that must never reach a child.
const INJECTION_PREFIXES: &[&str] = &["LD_", "DYLD_", "PYTHON"];

/// Build a sanitised copy of the current process environment.
pub fn sanitize_environment() -> HashMap<String, String> {
    sanitize(std::env::vars())
}

/// Sanitise an arbitrary environment iterator (testable form).
pub fn sanitize<I>(vars: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(name, _)| is_safe_var(name))
        .collect()
}

fn is_safe_var(name: &str) -> bool {
    if INJECTION_VARS.contains(&name) {
        return false;
    }
    if INJECTION_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return false;
    }
    SAFE_VARS.contains(&name) || SAFE_PREFIXES.iter().any(|p| name.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        sanitize(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    #[test]
    fn safe_variables_pass_through() {
        let out = env(&[
            ("PATH", "/usr/bin"),
            ("HOME", "/home/user"),
            ("LANG", "en_US.UTF-8"),
            ("LC_ALL", "C"),
            ("TERM", "xterm-256color"),
        ]);
        assert_eq!(out.len(), 5);
        assert_eq!(out["PATH"], "/usr/bin");
        assert_eq!(out["LC_ALL"], "C");
    }

    #[test]
    fn loader_preloads_are_stripped() {
        let out = env(&[
            ("PATH", "/usr/bin"),
            ("LD_PRELOAD", "/tmp/evil.so"),
            ("LD_LIBRARY_PATH", "/tmp"),
            ("DYLD_INSERT_LIBRARIES", "/tmp/evil.dylib"),
        ]);
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("PATH"));
    }

    #[test]
    fn interpreter_hooks_are_stripped() {
        let out = env(&[
            ("BASH_ENV", "/tmp/hook.sh"),
            ("IFS", "x"),
            ("PYTHONSTARTUP", "/tmp/hook.py"),
            ("PYTHONPATH", "/tmp"),
            ("RUBYOPT", "-r/tmp/hook"),
            ("NODE_OPTIONS", "--require /tmp/hook.js"),
            ("JAVA_TOOL_OPTIONS", "-javaagent:/tmp/evil.jar"),
        ]);
        assert!(out.is_empty());
    }

    #[test]
    fn proxies_and_agent_sockets_are_stripped() {
        let out = env(&[
            ("HTTP_PROXY", "http://mitm:3128"),
            ("https_proxy", "http://mitm:3128"),
            ("SSH_AUTH_SOCK", "/run/agent.sock"),
        ]);
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_variables_are_dropped_by_default() {
        let out = env(&[("SOME_APP_SECRET", "hunter2"), ("PATH", "/bin")]);
        assert_eq!(out.len(), 1);
        assert!(!out.contains_key("SOME_APP_SECRET"));
    }
}
