//! YubiKey OATH CLI Example
//!
//! Drives the OATH engine over a PC/SC reader on macOS, Linux, and Windows.
//! A key in a USB port or on an NFC reader stays present for the whole
//! command, so every command here is one or more presentments back to back.
//!
//! # Prerequisites
//!
//! - A YubiKey with the OATH applet (YubiKey NEO, 4 or 5 series)
//! - PC/SC daemon running (built-in on macOS/Windows, `pcscd` on Linux)
//!
//! # Quick Start
//!
//! ```bash
//! cargo run --example oath-cli -p yubikey-oath-core --features pcsc -- list
//! cargo run --example oath-cli -p yubikey-oath-core --features pcsc -- codes
//! cargo run --example oath-cli -p yubikey-oath-core --features pcsc -- \
//!     add 'otpauth://totp/Example:alice?secret=JBSWY3DPEHPK3PXP'
//! ```
//!
//! Set `RUST_LOG=yubikey_oath_core=debug` to see every frame on the wire.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `list` | List available readers |
//! | `codes` | Show every credential and its current code |
//! | `code <name>` | Calculate one credential (HOTP or touch) |
//! | `add <uri>` | Add credentials from an `otpauth://` or migration URI |
//! | `delete <name>` | Delete a credential |
//! | `rename <name> <new> <base32>` | Rename a credential; the secret is rewritten |
//! | `password` | Set or change the OATH password |
//! | `reset` | Wipe the OATH applet |
//!
//! # Security Notes
//!
//! - The password is stretched on the host; only the derived key is used
//! - `reset` deletes every credential and removes the password

#![expect(unused_crate_dependencies, reason = "needed for CLI example")]

use std::env;
use std::io::{self, Write};

use tracing_subscriber::EnvFilter;
use yubikey_oath_core::auth::Password;
use yubikey_oath_core::yubikey::PcscTransport;
use yubikey_oath_core::{
    provisioning, AuthState, CredentialId, EnqueueOutcome, Engine, EngineConfig, MemoryKeyCache,
    Notification,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return;
    }

    match args[1].as_str() {
        "list" => cmd_list(),
        "codes" => cmd_codes(),
        "code" => cmd_code(&args[2..]),
        "add" => cmd_add(&args[2..]),
        "delete" => cmd_delete(&args[2..]),
        "rename" => cmd_rename(&args[2..]),
        "password" => cmd_password(),
        "reset" => cmd_reset(),
        "--help" | "-h" | "help" => print_help(),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_help();
        }
    }
}

fn print_help() {
    println!(
        r"YubiKey OATH CLI

USAGE:
    oath-cli <COMMAND>

COMMANDS:
    list                          List available readers
    codes                         Show every credential and its current code
    code <name>                   Calculate one credential
    add <uri>                     Add credentials from a provisioning URI
    delete <name>                 Delete a credential
    rename <name> <new> <base32>  Rename a credential
    password                      Set or change the OATH password
    reset                         Wipe the OATH applet
    help                          Show this help message

EXAMPLES:
    cargo run --example oath-cli --features pcsc -- codes
    cargo run --example oath-cli --features pcsc -- code 'Example:alice'
"
    );
}

fn cmd_list() {
    match PcscTransport::list_readers() {
        Ok(readers) if readers.is_empty() => {
            println!("No readers found.");
            println!("\nMake sure:");
            println!("  - Your YubiKey is plugged in or on the NFC reader");
            println!("  - The PC/SC daemon is running");
        }
        Ok(readers) => {
            println!("Found {} reader(s):\n", readers.len());
            for (i, reader) in readers.iter().enumerate() {
                println!("  [{}] {}", i + 1, reader);
            }
        }
        Err(e) => eprintln!("Error listing readers: {e}"),
    }
}

fn cmd_codes() {
    let Some((mut engine, _transport)) = open() else {
        return;
    };
    print_codes(&engine);
    engine.end_presentment();
}

fn cmd_code(args: &[String]) {
    let Some(name) = args.first() else {
        eprintln!("Usage: code <name>");
        return;
    };
    let id = CredentialId::new(name.as_str());
    run_intents(|engine| vec![engine.request_calculate(id.clone())], |engine| {
        match engine.snapshot().get(&id).and_then(|c| c.code) {
            Some(code) => println!("{id}  {code}"),
            None => eprintln!("No code for {id}"),
        }
    });
}

fn cmd_add(args: &[String]) {
    let Some(uri) = args.first() else {
        eprintln!("Usage: add <otpauth-uri>");
        return;
    };
    let drafts = match provisioning::parse_any(uri) {
        Ok(drafts) => drafts,
        Err(e) => {
            eprintln!("Cannot add: {e}");
            return;
        }
    };
    println!("Adding {} credential(s)...", drafts.len());
    run_intents(
        |engine| {
            drafts
                .into_iter()
                .filter_map(|draft| match engine.request_add(draft) {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        eprintln!("Skipped: {e}");
                        None
                    }
                })
                .collect()
        },
        print_codes,
    );
}

fn cmd_delete(args: &[String]) {
    let Some(name) = args.first() else {
        eprintln!("Usage: delete <name>");
        return;
    };
    let id = CredentialId::new(name.as_str());
    run_intents(|engine| vec![engine.request_delete(id)], print_codes);
}

fn cmd_rename(args: &[String]) {
    let [name, new_label, secret, ..] = args else {
        eprintln!("Usage: rename <name> <new-label> <base32-secret>");
        return;
    };
    // The token never reveals a secret, so the caller supplies it again.
    let secret = match provisioning::parse(&format!("otpauth://totp/x?secret={secret}")) {
        Ok(draft) => draft.secret,
        Err(e) => {
            eprintln!("Invalid secret: {e}");
            return;
        }
    };
    let id = CredentialId::new(name.as_str());
    run_intents(
        |engine| match engine.request_rename(id, new_label, secret) {
            Ok(outcome) => vec![outcome],
            Err(e) => {
                eprintln!("Cannot rename: {e}");
                Vec::new()
            }
        },
        print_codes,
    );
}

fn cmd_password() {
    let new_password = prompt("New password: ");
    run_intents(
        |engine| {
            let new_key = match Password::new(&new_password).and_then(|p| engine.derive_key(p)) {
                Ok(key) => key,
                Err(e) => {
                    eprintln!("Cannot derive key: {e}");
                    return Vec::new();
                }
            };
            // SET_CODE is accepted once the session is validated or unlocked.
            vec![engine.request_set_password(new_key)]
        },
        |_| println!("Password updated."),
    );
}

fn cmd_reset() {
    println!("WARNING: This deletes every OATH credential on the key!");
    if prompt("Type 'reset' to continue: ") != "reset" {
        return;
    }
    run_intents(|engine| vec![engine.request_reset()], |_| println!("OATH applet reset."));
}

/// Opens a presentment, unlocking the token if it asks for a password.
fn open() -> Option<(Engine, PcscTransport)> {
    let mut transport = match PcscTransport::connect() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to connect: {e}");
            return None;
        }
    };
    let mut engine = Engine::new(EngineConfig::default(), MemoryKeyCache::default());
    let notifications = engine.run_presentment(&mut transport);
    report(&notifications);

    if notifications
        .iter()
        .any(|n| matches!(n, Notification::PasswordRequired(_)))
    {
        let password = prompt("Password: ");
        let job = match Password::new(&password).and_then(|p| engine.begin_unlock(p, true)) {
            Ok(job) => job,
            Err(e) => {
                eprintln!("Cannot unlock: {e}");
                return None;
            }
        };
        match engine.key_derived(job.run()) {
            Ok(effects) => report(&engine.drive(&mut transport, effects)),
            Err(e) => {
                eprintln!("Cannot unlock: {e}");
                return None;
            }
        }
        if engine.auth_state() != AuthState::Validated {
            return None;
        }
    }
    Some((engine, transport))
}

/// Queues intents and runs presentments until the queue stops shrinking.
fn run_intents(
    queue: impl FnOnce(&mut Engine) -> Vec<EnqueueOutcome>,
    done: impl FnOnce(&Engine),
) {
    let Some((mut engine, mut transport)) = open() else {
        return;
    };
    if queue(&mut engine).is_empty() {
        return;
    }

    let mut remaining = engine.pending().len();
    while remaining > 0 {
        engine.end_presentment();
        report(&engine.run_presentment(&mut transport));
        let now = engine.pending().len();
        if now == remaining {
            eprintln!("{now} operation(s) could not run; leaving them");
            break;
        }
        remaining = now;
    }
    done(&engine);
    engine.end_presentment();
}

fn print_codes(engine: &Engine) {
    let snapshot = engine.snapshot();
    if snapshot.credentials().is_empty() {
        println!("No credentials.");
        return;
    }
    for credential in snapshot.credentials() {
        let code = credential
            .code
            .map_or_else(|| "[touch or calculate]".to_string(), |c| c.to_string());
        println!("{:<40} {code}", credential.id);
    }
}

fn report(notifications: &[Notification]) {
    for notification in notifications {
        match notification {
            Notification::OperationFailed { id, error } => eprintln!("Operation {id} failed: {error}"),
            Notification::MaybePartiallyApplied(id) => {
                eprintln!("Operation {id} may have been applied; check the key before retrying");
            }
            Notification::Aborted(error) => eprintln!("Presentment aborted: {error}"),
            _ => {}
        }
    }
}

fn prompt(label: &str) -> String {
    print!("{label}");
    io::stdout().flush().unwrap();

    let mut line = String::new();
    io::stdin().read_line(&mut line).unwrap();
    line.trim().to_string()
}
