use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};
use modspresso::{ConnectionParams, DeviceEvent, EspressoDevice, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("☕ Modspresso Monitor Example");
    info!("Searching for Modspresso controllers...");

    let device = EspressoDevice::with_bluetooth(ConnectionParams::default()).await?;
    let mut events = device.subscribe();

    match device.connect_first().await {
        Ok(peripheral) => info!("✅ Connected to: {}", peripheral.name),
        Err(e) => {
            error!("❌ Failed to connect to device: {}", e);
            return Err(e);
        }
    }

    device.request_status().await?;
    device.request_profile_status().await?;

    info!("🔍 Monitoring for 60 seconds...");
    let monitor = async {
        while let Ok(event) = events.recv().await {
            match event {
                DeviceEvent::Status(status) => {
                    println!(
                        "📊 {:5.1} bar | running: {:5} | segment {}/{} | calibrated: {} | up {}s",
                        status.pressure,
                        status.is_running,
                        status.current_segment_index,
                        status.total_segments,
                        status.is_calibrated,
                        status.uptime_seconds
                    );
                }
                DeviceEvent::Log(line) => println!("📝 [{}] {}", line.level, line.text),
                DeviceEvent::Pressure(update) => println!(
                    "📈 t={:5.1}s  {:4.1} bar (target {:4.1})",
                    update.elapsed_seconds, update.current_pressure, update.target_pressure
                ),
                DeviceEvent::Inventory(inventory) => {
                    println!("💾 {} stored profile(s)", inventory.profile_count);
                    for profile in inventory.profiles {
                        println!(
                            "  [{}] {} ({} segments, {}s)",
                            profile.id, profile.name, profile.segment_count, profile.total_duration
                        );
                    }
                }
                DeviceEvent::Disconnected(reason) => {
                    warn!("⚠️ Link closed ({reason:?})");
                    break;
                }
                _ => {}
            }
        }
    };

    if timeout(Duration::from_secs(60), monitor).await.is_err() {
        info!("Monitoring finished");
    }

    device.disconnect().await?;
    info!("👋 Disconnected");
    Ok(())
}
