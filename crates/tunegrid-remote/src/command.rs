//! Command-line decomposition for binary pre-flight checks.

/// Tokens that precede the binary without being one.
const PREFIX_WORDS: [&str; 3] = ["export", "sudo", "&&"];

/// The executable a single sub-command runs.
///
/// Skips blank tokens, `KEY=VALUE` assignments, and the words `export`,
/// `sudo` and `&&`. Returns `None` if nothing is left.
pub fn binary_of(sub_command: &str) -> Option<&str> {
    sub_command
        .split(' ')
        .map(str::trim)
        .find(|tok| !tok.is_empty() && !tok.contains('=') && !PREFIX_WORDS.contains(tok))
}

/// Split a command line into sub-commands on `;` and `|`.
///
/// Blank pieces (a trailing `;`, `||`) are dropped.
pub fn split_subcommands(cmd: &str) -> Vec<&str> {
    cmd.split([';', '|'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_assignment_is_skipped() {
        assert_eq!(binary_of("ENVVAR=1 ls -al"), Some("ls"));
    }

    #[test]
    fn prefix_words_are_skipped() {
        assert_eq!(binary_of("sudo   reboot"), Some("reboot"));
        assert_eq!(binary_of("export A=1 && B=2 fin -i x"), Some("fin"));
        assert_eq!(binary_of("  "), None);
        assert_eq!(binary_of("A=1"), None);
    }

    #[test]
    fn pipes_and_semicolons_split() {
        assert_eq!(
            split_subcommands("ls | nonexistent_binary_xyz"),
            vec!["ls", "nonexistent_binary_xyz"]
        );
        assert_eq!(
            split_subcommands("cd /tmp; GPU_DEVICE_ORDINAL=0 clinfo | grep gfx;"),
            vec!["cd /tmp", "GPU_DEVICE_ORDINAL=0 clinfo", "grep gfx"]
        );
    }

    #[test]
    fn logical_or_leaves_no_empty_piece() {
        assert_eq!(split_subcommands("true || false"), vec!["true", "false"]);
    }
}
