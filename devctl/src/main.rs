//! Control client for the device rig.
//!
//! Issues one control-plane request against the first available device and
//! exits with the errno-style code on failure:
//!
//!   devctl print <text>   echo text to the diagnostic log (unprivileged)
//!   devctl panic <text>   log text, then kill the hosting process (admin)
//!   devctl oops           trigger a deliberate fault (admin)

use memdev::{Config, Credentials, DeviceError, Rig};

fn usage(prog: &str) -> ! {
    eprintln!("usage: {prog} print <text>");
    eprintln!("       {prog} panic <text>");
    eprintln!("       {prog} oops");
    std::process::exit(DeviceError::InvalidArgument.code());
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let prog = args.first().map_or("devctl", String::as_str);
    let Some(verb) = args.get(1).cloned() else {
        usage(prog);
    };
    let arg = match verb.as_str() {
        "print" | "panic" => {
            let Some(text) = args.get(2) else {
                usage(prog);
            };
            // The wire form is NUL-terminated.
            let mut wire = text.clone().into_bytes();
            wire.push(0);
            wire
        }
        "oops" => Vec::new(),
        _ => usage(prog),
    };

    let rig = match Rig::start(Config::from_env()).await {
        Ok(rig) => rig,
        Err(e) => {
            eprintln!("{prog}: {e}");
            std::process::exit(e.code());
        }
    };
    let prefix = rig.config().prefix.clone();
    let client = rig.client();
    let creds = Credentials::from_process();

    // Bare prefix first, then the first indexed entry.
    let fd = match client.open_first(&prefix, creds).await {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("{prog}: open {prefix}: {e}");
            std::process::exit(e.code());
        }
    };
    tracing::info!(
        fd = fd.0,
        verb = verb.as_str(),
        admin = creds.is_admin(),
        "issuing control request"
    );

    let result = client.control(fd, &verb, &arg).await;
    let _ = client.close(fd).await;
    drop(client);
    rig.shutdown().await;

    if let Err(e) = result {
        eprintln!("{prog}: {verb}: {e}");
        std::process::exit(e.code());
    }
}
