//! Tokenised command denylist with unicode normalisation.
//!
//! [`validate_command_secure`] runs a fixed pipeline over a candidate shell
//! command before the bash tool may execute it:
//!
//! 1. NFKC-normalise (homoglyph variants of a blocked command normalise to
//!    the blocked form, so both spellings get the same verdict).
//! 2. Reject wrapped shell invocations (`sh -c …`, `bash -c …`, including
//!    path-qualified and mixed-case forms).
//! 3. Reject backticks anywhere.
//! 4. Tokenise honouring quotes and escapes; judge the base command against
//!    the destructive-operation denylist and the obfuscation patterns.
//! 5. Reject interactive commands (no TTY in tool context).
//! 6. Reject standalone `&` backgrounding (`&&` and fd redirects pass).
//! 7. Reject privilege escalators.
//! 8. Reject the eval family.
//! 9. Enforce hard limits (length, newlines, escapes, NUL).
//! 10. Apply data-exfiltration heuristics.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::error::CoreError;

/// Commands longer than this are refused outright.
pub const MAX_COMMAND_LENGTH: usize = 10_000;
/// More newlines than this means a script, not a command.
pub const MAX_NEWLINES: usize = 3;

static PIPE_TO_SHELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\|\s*(ba|z|da|k)?sh\b").expect("pipe-to-shell regex"));
static COMMAND_SUBSTITUTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\(").expect("substitution regex"));
static DEV_TCP: Lazy<Regex> = Lazy::new(|| Regex::new(r"/dev/tcp/").expect("dev-tcp regex"));
static DEV_BLOCK_WRITE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r">\s*/dev/(sd|hd|nvme|mmcblk)").expect("block-device regex"));
static FORK_BOMB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":\s*\(\s*\)\s*\{").expect("fork-bomb regex"));
static FD_REDIRECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]*>&[0-9]*|&>").expect("fd-redirect regex"));
static ENCODED_PIPE_TO_NET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(base64|xxd|openssl)\b[^|]*\|[^|]*\b(curl|wget|nc|ncat)\b")
        .expect("encoded-pipe regex")
});
static REMOTE_COPY_TARGET: Lazy<Regex> = Lazy::new(|| {
    // scp/sftp/rsync with a user@host operand
    Regex::new(r"\b(scp|sftp|rsync)\b.*\S+@\S+").expect("remote-copy regex")
});
static POWERSHELL_BYPASS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)powershell(\.exe)?\s.*(-enc\b|-encodedcommand\b|-e\s|-ep\s+bypass|-executionpolicy\s+bypass)")
        .expect("powershell regex")
});

const SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh", "fish"];

const INTERACTIVE_COMMANDS: &[&str] = &[
    "vim", "vi", "nano", "emacs", "ssh", "telnet", "ftp", "mysql", "psql", "sqlite3", "top",
    "htop", "less", "more", "watch", "screen", "tmux",
];

const PRIVILEGE_ESCALATORS: &[&str] = &["sudo", "su", "doas", "pkexec", "runas"];

const EVAL_FAMILY: &[&str] = &["eval", "builtin", "source", "."];

/// Validate a shell command against the destructive/obfuscation policy.
///
/// Returns `Ok(())` when the command may be executed. Every rejection carries
/// a reason naming the matched rule, never the full command line.
pub fn validate_command_secure(raw: &str) -> Result<(), CoreError> {
    // Hard byte-level checks first — the rest of the pipeline assumes sane
    // input.
    if raw.contains('\0') {
        return Err(CoreError::CommandBlocked("NUL byte in command".into()));
    }
    if raw.len() > MAX_COMMAND_LENGTH {
        return Err(CoreError::CommandBlocked(format!(
            "command exceeds {MAX_COMMAND_LENGTH} characters"
        )));
    }
    if raw.matches('\n').count() > MAX_NEWLINES {
        return Err(CoreError::CommandBlocked(format!(
            "command exceeds {MAX_NEWLINES} newlines"
        )));
    }
    let escape_count = raw.matches("\\x").count() + raw.matches("\\0").count();
    if escape_count > 1 {
        return Err(CoreError::CommandBlocked(
            "multiple hex/octal escapes".into(),
        ));
    }

    // Everything below judges the NFKC form so homoglyph spellings cannot
    // slip past the token checks.
    let cmd: String = raw.nfkc().collect();
    let lower = cmd.to_lowercase();

    if cmd.contains('`') {
        return Err(CoreError::CommandBlocked("backtick substitution".into()));
    }
    if COMMAND_SUBSTITUTION.is_match(&cmd) {
        return Err(CoreError::CommandBlocked("command substitution".into()));
    }

    let tokens = tokenize(&cmd);
    if tokens.is_empty() {
        return Err(CoreError::CommandBlocked("empty command".into()));
    }
    let base = base_command(&tokens[0]);

    // Wrapped shells defeat every downstream token check, so they are
    // refused as a class.
    if SHELLS.contains(&base.as_str()) && tokens.iter().any(|t| t == "-c") {
        return Err(CoreError::CommandBlocked(format!(
            "wrapped shell invocation ({base} -c)"
        )));
    }

    check_denylist(&base, &tokens, &lower)?;

    if INTERACTIVE_COMMANDS.contains(&base.as_str()) {
        return Err(CoreError::InteractiveCommand(base));
    }

    check_backgrounding(&cmd)?;

    if PRIVILEGE_ESCALATORS.contains(&base.as_str()) {
        return Err(CoreError::PrivilegedCommand(base));
    }
    if POWERSHELL_BYPASS.is_match(&cmd) {
        return Err(CoreError::PrivilegedCommand("powershell bypass".into()));
    }

    if EVAL_FAMILY.contains(&base.as_str()) {
        return Err(CoreError::CommandBlocked(format!("eval-family command ({base})")));
    }

    check_exfiltration(&base, &tokens, &lower)?;

    Ok(())
}

/// Split a command line into tokens, honouring single quotes, double quotes
/// and backslash escapes. Quoting characters are stripped from the tokens —
/// `rm "-rf"` and `rm -rf` tokenise identically.
pub fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                if let Some(&next) = chars.peek() {
                    current.push(next);
                    chars.next();
                }
            }
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Lower-cased basename of the first token, so `/Usr/Bin/Sudo` judges as
/// `sudo`.
fn base_command(first_token: &str) -> String {
    first_token
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(first_token)
        .to_lowercase()
}

fn check_denylist(base: &str, tokens: &[String], lower: &str) -> Result<(), CoreError> {
    // rm with recursive+force flags against root or a root glob.
    if base == "rm" {
        let recursive_force = tokens.iter().any(|t| {
            let t = t.to_lowercase();
            t.starts_with('-') && t.contains('r') && t.contains('f')
        }) || (tokens.iter().any(|t| t.eq_ignore_ascii_case("-r"))
            && tokens.iter().any(|t| t.eq_ignore_ascii_case("-f")));
        let targets_root = tokens
            .iter()
            .any(|t| t == "/" || t == "/*" || t.starts_with("/ ") || t == "--no-preserve-root");
        if recursive_force && targets_root {
            return Err(CoreError::CommandBlocked("recursive delete of root".into()));
        }
    }

    if base.starts_with("mkfs") {
        return Err(CoreError::CommandBlocked("filesystem format".into()));
    }

    if base == "dd" && tokens.iter().any(|t| t.starts_with("if=")) {
        return Err(CoreError::CommandBlocked("raw device copy (dd)".into()));
    }

    if FORK_BOMB.is_match(lower) {
        return Err(CoreError::CommandBlocked("fork bomb".into()));
    }
    if DEV_BLOCK_WRITE.is_match(lower) {
        return Err(CoreError::CommandBlocked("write to block device".into()));
    }
    if PIPE_TO_SHELL.is_match(lower) {
        return Err(CoreError::CommandBlocked("pipe into shell".into()));
    }
    if DEV_TCP.is_match(lower) {
        return Err(CoreError::CommandBlocked("raw TCP device".into()));
    }

    Ok(())
}

fn check_backgrounding(cmd: &str) -> Result<(), CoreError> {
    // Strip the legitimate uses of '&' first: '&&' chains and fd redirects
    // ('2>&1', '&>'). Whatever remains is job-control backgrounding.
    let stripped = FD_REDIRECT.replace_all(cmd, "");
    let stripped = stripped.replace("&&", "");
    if stripped.contains('&') {
        return Err(CoreError::CommandBlocked("background execution (&)".into()));
    }
    Ok(())
}

fn check_exfiltration(base: &str, tokens: &[String], lower: &str) -> Result<(), CoreError> {
    if base == "curl" || base == "wget" {
        let uploads = tokens.iter().any(|t| {
            t == "-d"
                || t.starts_with("--data")
                || t == "-F"
                || t.starts_with("--form")
                || t == "-T"
                || t.starts_with("--upload-file")
                || t.starts_with("--post-file")
                || t.starts_with("--post-data")
        });
        let posts = tokens
            .windows(2)
            .any(|w| w[0] == "-X" && w[1].eq_ignore_ascii_case("post"));
        if uploads || posts {
            return Err(CoreError::ExfiltrationRisk(format!("{base} upload")));
        }
    }

    if (base == "nc" || base == "ncat" || base == "netcat") && lower.contains('<') {
        return Err(CoreError::ExfiltrationRisk("netcat with input redirection".into()));
    }

    if REMOTE_COPY_TARGET.is_match(lower) {
        return Err(CoreError::ExfiltrationRisk("copy to remote host".into()));
    }

    if ENCODED_PIPE_TO_NET.is_match(lower) {
        return Err(CoreError::ExfiltrationRisk("encoded pipe into network tool".into()));
    }

    Ok(())
}
