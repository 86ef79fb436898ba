use std::io::{self, BufRead, IsTerminal, Read, Write};
use std::path::Path;
use std::process::ExitCode;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tclbridge::cli::{self, RcFile};
use tclbridge::engine::parse::is_complete;
use tclbridge::{check_arity, Error, Session, SessionConfig, Value};

fn init_tracing(debug: bool) {
    let default = if debug { "tclbridge=debug" } else { "tclbridge=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init();
}

fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("tclbridge: {e}");
            eprintln!("{}", cli::USAGE);
            return ExitCode::from(2);
        }
    };
    init_tracing(args.debug);

    let config = match SessionConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("tclbridge: {e}");
            return ExitCode::FAILURE;
        }
    };
    let diagnostics = config.diagnostics || args.debug;
    let session = Session::with_config(config.diagnostics(diagnostics));

    // ── Script-visible globals ────────────────────────────────────────────────
    let argv0 = match &args.file {
        Some(path) => path.display().to_string(),
        None => "tclbridge".to_owned(),
    };
    let globals = [
        ("argv0", Value::from(argv0)),
        ("argc", Value::from(args.args.len())),
        ("argv", Value::from(args.args.clone())),
        ("tcl_interactive", Value::from(args.file.is_none() && args.command.is_none() && io::stdin().is_terminal())),
    ];
    for (name, value) in globals {
        if let Err(e) = session.set_var(name, value) {
            eprintln!("tclbridge: {e}");
            return ExitCode::FAILURE;
        }
    }

    session.create_command("exit", |_: &Session, args: &[Value]| -> tclbridge::Result<()> {
        check_arity(args, 0, Some(1), "?returnCode?")?;
        let code = match args.first() {
            Some(v) => v.to_int()?,
            None => 0,
        };
        let _ = io::stdout().flush();
        std::process::exit(code as i32)
    });

    // ── Startup script ────────────────────────────────────────────────────────
    let rc = match args.rc {
        RcFile::Skip => None,
        RcFile::Explicit(path) => Some(path),
        RcFile::Search => cli::find_rc_file(),
    };
    if let Some(path) = rc {
        if let Err(e) = session.eval_file::<()>(&path) {
            eprintln!("tclbridge: warning: {}: {}", path.display(), describe(&e));
        }
    }

    // ── Main script ───────────────────────────────────────────────────────────
    let outcome = if let Some(script) = &args.command {
        session.eval::<()>(script)
    } else if let Some(path) = &args.file {
        run_file(&session, path)
    } else if io::stdin().is_terminal() {
        return repl(&session);
    } else {
        let mut script = String::new();
        match io::stdin().read_to_string(&mut script) {
            Ok(_) => session.eval::<()>(&script),
            Err(e) => Err(Error::host(e)),
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", describe(&e));
            ExitCode::FAILURE
        }
    }
}

fn run_file(session: &Session, path: &Path) -> tclbridge::Result<()> {
    match session.eval_file::<()>(path) {
        // A top-level `return` just ends the file.
        Err(Error::Return) => Ok(()),
        other => other,
    }
}

/// The full trace for script errors, the message for everything else.
fn describe(err: &Error) -> String {
    match err.envelope() {
        Some(env) if !env.error_info.is_empty() => env.error_info.clone(),
        _ => err.to_string(),
    }
}

fn repl(session: &Session) -> ExitCode {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut buffer = String::new();
    loop {
        print!("{}", if buffer.is_empty() { "% " } else { "> " });
        let _ = io::stdout().flush();
        let Some(line) = lines.next() else {
            println!();
            return ExitCode::SUCCESS;
        };
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("tclbridge: {e}");
                return ExitCode::FAILURE;
            }
        };
        buffer.push_str(&line);
        buffer.push('\n');
        if !is_complete(&buffer) {
            continue;
        }
        let script = std::mem::take(&mut buffer);
        match session.eval::<String>(&script) {
            Ok(result) if result.is_empty() => {}
            Ok(result) => println!("{result}"),
            Err(e) => eprintln!("{}", describe(&e)),
        }
    }
}
