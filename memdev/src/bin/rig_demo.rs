//! Demo: bring the whole rig up, push bytes through one device while a
//! polling reader follows along, replay the stream from the start, then
//! shut everything down cleanly.
//!
//! Run with: RUST_LOG=info cargo run --bin rig_demo

use std::time::Duration;

use memdev::{Config, Credentials, Rig, SeekFrom};

const LINES: u32 = 5;

#[tokio::main]
async fn main() -> Result<(), memdev::DeviceError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Short intervals so the demo shows beacon and worker activity within
    // a couple of seconds.
    let config = Config {
        beacon_interval: Duration::from_millis(700),
        worker_interval: Duration::from_millis(500),
        ..Config::from_env()
    };
    let rig = Rig::start(config).await?;

    let client = rig.client();
    let creds = Credentials::from_process();

    // Writer and reader sessions on the same device, each with its own
    // cursor, opened through the bare-prefix fallback.
    let wfd = client.open_first("memdev", creds).await?;
    let rfd = client.open_first("memdev", creds).await?;

    let writer = {
        let client = client.clone();
        tokio::spawn(async move {
            for i in 0..LINES {
                let line = format!("tick {i}\n");
                match client.write(wfd, line.as_bytes()).await {
                    Ok(n) => log::info!("demo writer: pushed {n} bytes"),
                    Err(e) => {
                        log::error!("demo writer: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            let _ = client.close(wfd).await;
        })
    };

    let reader = {
        let client = client.clone();
        tokio::spawn(async move {
            let expected = (LINES as usize) * "tick 0\n".len();
            let mut total = 0usize;
            while total < expected {
                match client.wait_readable(rfd).await {
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("demo reader: wait ended: {e}");
                        break;
                    }
                }
                match client.read(rfd, 16).await {
                    Ok(data) => {
                        total += data.len();
                        log::info!(
                            "demo reader: [{}] ({total}/{expected})",
                            String::from_utf8_lossy(&data).trim_end()
                        );
                    }
                    Err(e) => {
                        log::error!("demo reader: {e}");
                        break;
                    }
                }
            }
            let _ = client.close(rfd).await;
        })
    };

    let _ = writer.await;
    let _ = reader.await;

    // Replay from the start on a fresh session, then say goodbye through
    // the control plane.
    let fd = client.open("memdev0", creds).await?;
    let pos = client.seek(fd, SeekFrom::Start(0)).await?;
    let replay = client.read(fd, 128).await?;
    log::info!("replay from {pos}: {} bytes", replay.len());
    client.control(fd, "print", b"demo complete\0").await?;
    client.close(fd).await?;
    drop(client);

    log::info!("beacons fired: {:?}", rig.beacons().fire_counts());
    log::info!("worker heartbeats: {:?}", rig.workers().heartbeat_counts());
    rig.shutdown().await;
    Ok(())
}
