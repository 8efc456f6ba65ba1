//! Run one detection against a local backend using a still image as the camera
//!
//! cargo run -p minori-eye --example still_capture -- leaf.jpg rice

use minori_core::{Crop, MinoriConfig};
use minori_eye::{SessionController, SessionEvent, StillImageBackend};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or("usage: still_capture <image> [crop]")?;
    let crop: Crop = args.next().as_deref().unwrap_or("rice").parse()?;

    let camera = Arc::new(StillImageBackend::from_path(&path)?);
    let session = SessionController::new(MinoriConfig::from_env(), camera)?;
    let mut events = session.subscribe();

    session.select_crop(Some(crop));
    session.start_camera().await?;

    let outcome = session.single_capture()?.wait().await;
    session.stop_camera().await;

    while let Ok(event) = events.try_recv() {
        if let SessionEvent::ConnectivityNotice(notice) = event {
            println!("note: {}", notice);
        }
    }

    match outcome?.detection() {
        Some(detection) => {
            println!("Crop:     {}", detection.crop);
            println!("Disease:  {}", detection.disease_display());
            println!("Solution: {}", detection.solution);
        }
        None => {
            if let Some(error) = session.snapshot().error {
                println!("Detection failed: {}", error.message);
            }
        }
    }
    Ok(())
}
