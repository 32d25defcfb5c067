//! groutd — the grout router control-plane daemon.
//!
//! Startup: locale, arguments, logging, module init, API socket, signals,
//! readiness message, then the reactor loop until a signal breaks it.
//! Shutdown runs the same steps backwards and unlinks the socket.

use std::path::PathBuf;
use std::process::ExitCode;

use grout_control::config::{Config, DEFAULT_SOCK_PATH};
use grout_control::module::{
    modules_dp_fini, modules_dp_init, modules_fini, modules_init, register_all,
};
use grout_control::notify;
use grout_control::server::Server;
use grout_control::Control;
use grout_core::errno::Errno;
use grout_core::{log, log_err, log_notice};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// Please keep options/flags in alphabetical order.

fn usage(prog: &str) {
    println!("Usage: {} [-h] [-p] [-s PATH] [-t] [-V] [-v] [-x]", prog);
    println!();
    println!("  Graph router control plane version {}.", VERSION);
    println!();
    println!("options:");
    println!("  -h, --help                 Display this help message and exit.");
    println!("  -p, --poll-mode            Disable automatic micro-sleep.");
    println!("  -s PATH, --socket PATH     Path the control plane API socket.");
    println!("                             Default: GROUT_SOCK_PATH from env or");
    println!("                             {}.", DEFAULT_SOCK_PATH);
    println!("  -t, --test-mode            Run in test mode (no hugepages).");
    println!("  -V, --version              Print version and exit.");
    println!("  -v, --verbose              Increase verbosity.");
    println!("  -x, --trace-packets        Print all ingress/egress packets.");
}

enum Parsed {
    Run(Config, u8),
    Exit,
}

fn parse_args(argv: &[String]) -> Result<Parsed, String> {
    let mut cfg = Config::default();
    let mut verbose = 0u8;

    let mut iter = argv.iter().skip(1);
    while let Some(arg) = iter.next() {
        if let Some(long) = arg.strip_prefix("--") {
            match long {
                "help" => {
                    usage(&argv[0]);
                    return Ok(Parsed::Exit);
                }
                "poll-mode" => cfg.poll_mode = true,
                "socket" => {
                    let path = iter.next().ok_or("--socket requires a value")?;
                    cfg.api_sock_path = PathBuf::from(path);
                }
                "test-mode" => cfg.test_mode = true,
                "version" => {
                    println!("grout {}", VERSION);
                    return Ok(Parsed::Exit);
                }
                "verbose" => verbose = verbose.saturating_add(1),
                "trace-packets" => cfg.trace_packets = true,
                _ => return Err(format!("--{}: unknown option", long)),
            }
        } else if let Some(shorts) = arg.strip_prefix('-') {
            if shorts.is_empty() {
                return Err("invalid arguments".to_string());
            }
            let mut chars = shorts.chars();
            while let Some(c) = chars.next() {
                match c {
                    'h' => {
                        usage(&argv[0]);
                        return Ok(Parsed::Exit);
                    }
                    'p' => cfg.poll_mode = true,
                    's' => {
                        // value attached to the bundle or in the next argument
                        let rest: String = chars.by_ref().collect();
                        let path = if rest.is_empty() {
                            iter.next().cloned().ok_or("-s requires a value")?
                        } else {
                            rest
                        };
                        cfg.api_sock_path = PathBuf::from(path);
                    }
                    't' => cfg.test_mode = true,
                    'V' => {
                        println!("grout {}", VERSION);
                        return Ok(Parsed::Exit);
                    }
                    'v' => verbose = verbose.saturating_add(1),
                    'x' => cfg.trace_packets = true,
                    other => return Err(format!("-{}: unknown option", other)),
                }
            }
        } else {
            return Err("invalid arguments".to_string());
        }
    }

    Ok(Parsed::Run(cfg, verbose))
}

fn fatal(err: Errno, ctl: &mut Control) -> ExitCode {
    modules_dp_fini(ctl);
    modules_fini(ctl);
    let _ = notify::notify_errno(err);
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    // name validation depends on a UTF-8 character type
    let locale = unsafe { libc::setlocale(libc::LC_CTYPE, c"C.UTF-8".as_ptr()) };
    if locale.is_null() {
        eprintln!("error: setlocale(LC_CTYPE, C.UTF-8) failed");
        return ExitCode::FAILURE;
    }

    let argv: Vec<String> = std::env::args().collect();
    let (cfg, verbose) = match parse_args(&argv) {
        Ok(Parsed::Run(cfg, verbose)) => (cfg, verbose),
        Ok(Parsed::Exit) => return ExitCode::SUCCESS,
        Err(msg) => {
            usage(&argv[0]);
            eprintln!("error: {}", msg);
            return ExitCode::FAILURE;
        }
    };

    log::init(verbose);
    log_notice!("starting grout version {}", VERSION);

    let mut ctl = Control::new(cfg.clone());
    register_all(&mut ctl);
    modules_init(&mut ctl);
    modules_dp_init(&mut ctl);

    let mut server = match Server::new(&cfg) {
        Ok(server) => server,
        Err(err) => return fatal(err, &mut ctl),
    };
    if let Err(err) = server.register_signals() {
        log_err!("register_signals: {}", err.desc());
        return fatal(err, &mut ctl);
    }

    if let Err(err) = notify::notify_ready(VERSION) {
        log_err!("notify: {}", err.desc());
    }

    // run until signal or fatal error
    let code = match server.run(&mut ctl) {
        Ok(()) => {
            if let Err(err) = notify::notify_stopping() {
                log_err!("notify: {}", err.desc());
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            let _ = notify::notify_errno(err);
            ExitCode::FAILURE
        }
    };

    server.shutdown();
    drop(server);
    modules_dp_fini(&mut ctl);
    modules_fini(&mut ctl);
    let _ = std::fs::remove_file(&cfg.api_sock_path);

    code
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("groutd")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_defaults() {
        let Parsed::Run(cfg, verbose) = parse_args(&argv(&[])).unwrap() else {
            panic!("expected run");
        };
        assert!(!cfg.poll_mode && !cfg.test_mode && !cfg.trace_packets);
        assert_eq!(verbose, 0);
    }

    #[test]
    fn test_parse_flags_and_socket() {
        let Parsed::Run(cfg, verbose) =
            parse_args(&argv(&["-p", "-t", "-x", "-vv", "-s", "/tmp/x.sock"])).unwrap()
        else {
            panic!("expected run");
        };
        assert!(cfg.poll_mode && cfg.test_mode && cfg.trace_packets);
        assert_eq!(verbose, 2);
        assert_eq!(cfg.api_sock_path, PathBuf::from("/tmp/x.sock"));
    }

    #[test]
    fn test_parse_bundled_socket_value() {
        let Parsed::Run(cfg, _) = parse_args(&argv(&["-ts/tmp/y.sock"])).unwrap() else {
            panic!("expected run");
        };
        assert!(cfg.test_mode);
        assert_eq!(cfg.api_sock_path, PathBuf::from("/tmp/y.sock"));
    }

    #[test]
    fn test_parse_long_options() {
        let Parsed::Run(cfg, verbose) =
            parse_args(&argv(&["--poll-mode", "--verbose", "--socket", "/tmp/z.sock"])).unwrap()
        else {
            panic!("expected run");
        };
        assert!(cfg.poll_mode);
        assert_eq!(verbose, 1);
        assert_eq!(cfg.api_sock_path, PathBuf::from("/tmp/z.sock"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&argv(&["-z"])).is_err());
        assert!(parse_args(&argv(&["--bogus"])).is_err());
        assert!(parse_args(&argv(&["-s"])).is_err());
        assert!(parse_args(&argv(&["stray"])).is_err());
    }
}
