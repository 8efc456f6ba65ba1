// Terminal rendering of session results

use chrono::Local;
use minori_core::{Crop, Detection, DetectionResult};
use minori_eye::{SessionController, SessionEvent};

pub fn print_crops() {
    for crop in Crop::ALL {
        println!("{:<8} {}", crop.as_str(), crop.label());
    }
}

pub fn print_watching(session: &SessionController) {
    let crop = session.crop().map(|c| c.label()).unwrap_or("-");
    let interval = session.config().capture.interval_ms;
    println!("Watching {} every {}ms (Ctrl-C to stop)", crop, interval);
}

pub fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::ResultUpdated(detection) => {
            println!("[{}]", timestamp());
            print_detection(detection);
        }
        SessionEvent::ErrorRaised { message, .. } => {
            println!("[{}] Error: {}", timestamp(), message);
        }
        SessionEvent::ConnectivityNotice(notice) => {
            println!("[{}] Notice: {}", timestamp(), notice);
        }
        SessionEvent::FrameProcessed { count } => {
            println!("Frames processed: {}", count);
        }
        _ => {}
    }
}

pub fn print_outcome(result: &DetectionResult) {
    match result {
        DetectionResult::Detected(detection) => print_detection(detection),
        DetectionResult::Failed { error } => println!("Detection failed: {}", error),
    }
}

pub fn print_summary(frames: u64) {
    println!("Stopped after {} processed frames", frames);
}

fn print_detection(detection: &Detection) {
    let crop = detection
        .crop
        .parse::<Crop>()
        .map(|c| c.label().to_string())
        .unwrap_or_else(|_| detection.crop.clone());
    let status = if detection.is_healthy() {
        "Healthy"
    } else {
        "Disease detected"
    };

    println!("  Crop:     {}", crop);
    println!("  Disease:  {}", detection.disease_display());
    println!("  Status:   {}", status);
    if let Some(elapsed) = detection.processing_time() {
        println!("  Time:     {:.2}s", elapsed.as_secs_f64());
    }
    println!("  Solution: {}", detection.solution);
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}
