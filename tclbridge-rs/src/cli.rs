//! Command-line argument parsing.
//!
//! Usage:
//!   tclbridge [-d] [-n] [-f<rcfile>] [-c<script>] [<file> [<arg>...]]
//!
//! Everything after the script file belongs to the script (`$argv`), flags
//! included.

use std::path::PathBuf;

use directories::BaseDirs;

pub const USAGE: &str = "Usage: tclbridge [-d] [-n] [-f<rcfile>] [-c<script>] [<file> [<arg>...]]";

/// Name of the per-user startup script, looked up in the home directory.
pub const RC_FILE: &str = ".tclbridgerc";

// ── Public types ──────────────────────────────────────────────────────────────

/// Parsed command-line arguments.
#[derive(Debug, Default)]
pub struct CliArgs {
    /// Startup script selection.
    pub rc: RcFile,
    /// Script given with `-c`.
    pub command: Option<String>,
    /// Script file to run; stdin when neither this nor `command` is set.
    pub file: Option<PathBuf>,
    /// Arguments passed through to the script.
    pub args: Vec<String>,
    /// Debug logging and error diagnostics (`-d`).
    pub debug: bool,
}

#[derive(Debug, Default, PartialEq)]
pub enum RcFile {
    /// `~/.tclbridgerc` if it exists (default).
    #[default]
    Search,
    /// `-n`: no startup script.
    Skip,
    /// `-f<file>`: this startup script.
    Explicit(PathBuf),
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse `std::env::args()` and return [`CliArgs`] or an error message.
pub fn parse_args() -> Result<CliArgs, String> {
    let raw: Vec<String> = std::env::args().collect();
    parse_argv(raw.get(1..).unwrap_or_default())
}

/// Parse a slice of argument strings (exposed for testing).
pub fn parse_argv(argv: &[String]) -> Result<CliArgs, String> {
    let mut args = CliArgs::default();
    let mut i = 0;

    while i < argv.len() {
        let arg = argv[i].as_str();

        if arg == "--" {
            i += 1;
            break;
        }
        if !arg.starts_with('-') || arg == "-" {
            break;
        }

        let chars: Vec<char> = arg[1..].chars().collect();
        let mut j = 0;
        while j < chars.len() {
            match chars[j] {
                'd' => args.debug = true,
                'n' => args.rc = RcFile::Skip,

                // -f<file> or -f <file>
                'f' => {
                    let file = attached_or_next(&chars, &mut j, argv, &mut i)
                        .ok_or("-f requires a file argument")?;
                    args.rc = RcFile::Explicit(PathBuf::from(file));
                }

                // -c<script> or -c <script>
                'c' => {
                    let script = attached_or_next(&chars, &mut j, argv, &mut i)
                        .ok_or("-c requires a script argument")?;
                    args.command = Some(script);
                }

                c => return Err(format!("unknown option: -{c}")),
            }
            j += 1;
        }
        i += 1;
    }

    let mut rest = argv[i.min(argv.len())..].iter().cloned();
    if args.command.is_none() {
        args.file = rest.next().map(PathBuf::from);
    }
    args.args = rest.collect();
    Ok(args)
}

/// Value of a flag, either glued to it (`-cscript`) or the next argument.
fn attached_or_next(chars: &[char], j: &mut usize, argv: &[String], i: &mut usize) -> Option<String> {
    if *j + 1 < chars.len() {
        let s: String = chars[*j + 1..].iter().collect();
        *j = chars.len();
        Some(s)
    } else if *i + 1 < argv.len() {
        *i += 1;
        Some(argv[*i].clone())
    } else {
        None
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

/// `~/.tclbridgerc`, if it exists.
pub fn find_rc_file() -> Option<PathBuf> {
    let dirs = BaseDirs::new()?;
    let path = dirs.home_dir().join(RC_FILE);
    path.exists().then_some(path)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|&s| s.to_owned()).collect()
    }

    #[test]
    fn empty_args() {
        let a = parse_argv(&argv(&[])).unwrap();
        assert_eq!(a.rc, RcFile::Search);
        assert!(a.command.is_none() && a.file.is_none() && a.args.is_empty());
        assert!(!a.debug);
    }

    #[test]
    fn file_and_script_args() {
        let a = parse_argv(&argv(&["run.tcl", "-x", "two"])).unwrap();
        assert_eq!(a.file, Some(PathBuf::from("run.tcl")));
        assert_eq!(a.args, ["-x", "two"]);
    }

    #[test]
    fn command_takes_all_positionals_as_args() {
        let a = parse_argv(&argv(&["-c", "puts $argv", "a", "b"])).unwrap();
        assert_eq!(a.command.as_deref(), Some("puts $argv"));
        assert!(a.file.is_none());
        assert_eq!(a.args, ["a", "b"]);
    }

    #[test]
    fn command_embedded() {
        let a = parse_argv(&argv(&["-cputs hi"])).unwrap();
        assert_eq!(a.command.as_deref(), Some("puts hi"));
    }

    #[test]
    fn combined_bool_flags() {
        let a = parse_argv(&argv(&["-dn"])).unwrap();
        assert!(a.debug);
        assert_eq!(a.rc, RcFile::Skip);
    }

    #[test]
    fn rc_explicit() {
        let a = parse_argv(&argv(&["-f", "my.rc"])).unwrap();
        assert_eq!(a.rc, RcFile::Explicit(PathBuf::from("my.rc")));
        let a = parse_argv(&argv(&["-fmy.rc"])).unwrap();
        assert_eq!(a.rc, RcFile::Explicit(PathBuf::from("my.rc")));
    }

    #[test]
    fn double_dash_ends_flags() {
        let a = parse_argv(&argv(&["--", "-d.tcl"])).unwrap();
        assert!(!a.debug);
        assert_eq!(a.file, Some(PathBuf::from("-d.tcl")));
    }

    #[test]
    fn missing_values() {
        assert!(parse_argv(&argv(&["-c"])).is_err());
        assert!(parse_argv(&argv(&["-f"])).is_err());
    }

    #[test]
    fn unknown_flag() {
        assert_eq!(parse_argv(&argv(&["-z"])).unwrap_err(), "unknown option: -z");
    }
}
