//! Remote command line composition
//!
//! Every command runs as `<login shell> -c <command>`, with the command passed
//! as one shell-quoted argument so the remote shell sees exactly the string
//! the caller wrote.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::borrow::Cow;

/// Login shell used when none is configured
pub const DEFAULT_LOGIN_SHELL: &str = "bash -l";

/// Quote `arg` as a single POSIX shell word.
///
/// Strings made only of characters no shell treats specially are returned as
/// is; anything else is wrapped in single quotes, with embedded single quotes
/// written as `'\''`.
pub fn quote(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty() && arg.chars().all(is_plain) {
        return Cow::Borrowed(arg);
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    Cow::Owned(quoted)
}

fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ',' | ':' | '/' | '@' | '%' | '+' | '=')
}

/// Wrap `command` so `shell` runs it as a login shell
pub fn login_shell(shell: &str, command: &str) -> String {
    format!("{} -c {}", shell, quote(command))
}

/// Command appending `content` to `path` on the remote host.
///
/// The payload travels inline as Base64 with line breaks removed, so its size
/// is bounded by the remote shell's command line limit.
pub fn upload(path: &str, content: &[u8]) -> String {
    let mut encoded = STANDARD.encode(content);
    encoded.retain(|c| c != '\n' && c != '\r');
    format!("(echo {} | base64 --decode) >> {}", encoded, quote(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_words_are_untouched() {
        assert_eq!(quote("ls"), "ls");
        assert_eq!(quote("/usr/bin/env"), "/usr/bin/env");
        assert_eq!(quote("KEY=value"), "KEY=value");
        assert!(matches!(quote("make"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_metacharacters_are_quoted() {
        assert_eq!(quote(""), "''");
        assert_eq!(quote("echo hello"), "'echo hello'");
        assert_eq!(quote("a; rm -rf /"), "'a; rm -rf /'");
        assert_eq!(quote("$(whoami)"), "'$(whoami)'");
        assert_eq!(quote("it's"), "'it'\\''s'");
        assert_eq!(quote("line1\nline2"), "'line1\nline2'");
    }

    #[test]
    fn test_login_shell_wrapping() {
        assert_eq!(login_shell(DEFAULT_LOGIN_SHELL, "echo hello"), "bash -l -c 'echo hello'");
        assert_eq!(login_shell("sh", "true"), "sh -c true");
    }

    #[test]
    fn test_upload_command() {
        assert_eq!(upload("/tmp/x", b"abc"), "(echo YWJj | base64 --decode) >> /tmp/x");
        assert_eq!(
            upload("/tmp/my file", b"hi"),
            "(echo aGk= | base64 --decode) >> '/tmp/my file'"
        );
    }

    #[test]
    fn test_upload_payload_has_no_line_breaks() {
        let content = vec![0xABu8; 4096];
        let command = upload("/tmp/blob", &content);
        assert!(!command.contains('\n'));
        assert!(!command.contains('\r'));
    }

    #[cfg(unix)]
    #[test]
    fn test_quoted_argument_survives_a_real_shell() {
        use std::process::Command;

        let tricky = "it's \"quoted\" $HOME `date` \\ * ?\nsecond line";
        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("printf %s {}", quote(tricky)))
            .output()
            .unwrap();

        assert!(output.status.success());
        assert_eq!(String::from_utf8(output.stdout).unwrap(), tricky);
    }
}
