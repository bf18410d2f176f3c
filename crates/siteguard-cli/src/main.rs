use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use siteguard_core::{
    ArcFaceMatcher, ComplianceTally, Detector, FaceMatcher, Frame, FrameAnnotator, Gallery,
    PpeDetector,
};
use siteguard_hw::{Camera, CaptureSettings, FrameSource};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "siteguard", about = "SiteGuard PPE compliance tools", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run PPE detection and face matching on a single image
    Detect {
        /// Image to analyse
        image: PathBuf,
        /// Directory with ppe.onnx, det_10g.onnx and w600k_r50.onnx
        #[arg(long, default_value = "./models")]
        model_dir: PathBuf,
        /// Face gallery (one sub-directory per identity)
        #[arg(long)]
        gallery: Option<PathBuf>,
        #[arg(long, default_value_t = siteguard_core::ppe_detector::DEFAULT_CONFIDENCE)]
        confidence: f32,
        #[arg(long, default_value_t = siteguard_core::face_matcher::DEFAULT_MATCH_THRESHOLD)]
        match_threshold: f32,
        /// Write the annotated frame here
        #[arg(long)]
        annotate: Option<PathBuf>,
        /// Label glyph scale for the annotated frame
        #[arg(long, default_value_t = 2)]
        text_scale: u32,
    },
    /// Encode a face gallery and list its identities
    Gallery {
        #[arg(long, default_value = "./Person_Dataset")]
        dir: PathBuf,
        #[arg(long, default_value = "./models")]
        model_dir: PathBuf,
    },
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics
    Test {
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        /// Frames to capture
        #[arg(long, default_value_t = 1)]
        frames: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Detect {
            image,
            model_dir,
            gallery,
            confidence,
            match_threshold,
            annotate,
            text_scale,
        } => detect(
            &image,
            &model_dir,
            gallery,
            confidence,
            match_threshold,
            annotate.map(|out| (out, FrameAnnotator::new(text_scale))),
        ),
        Commands::Gallery { dir, model_dir } => list_gallery(&dir, &model_dir),
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
        Commands::Test { device, frames } => camera_test(&device, frames),
    }
}

fn dir_str(dir: &std::path::Path) -> String {
    dir.to_string_lossy().into_owned()
}

fn detect(
    image: &std::path::Path,
    model_dir: &std::path::Path,
    gallery_dir: Option<PathBuf>,
    confidence: f32,
    match_threshold: f32,
    annotate: Option<(PathBuf, FrameAnnotator)>,
) -> Result<()> {
    let rgb = image::open(image)
        .with_context(|| format!("opening {}", image.display()))?
        .to_rgb8();
    let frame = Frame::new(rgb, 0);

    let mut detector =
        PpeDetector::load_default(&dir_str(&model_dir.join("ppe.onnx")), confidence)?;
    let mut matcher = ArcFaceMatcher::load(&dir_str(model_dir), match_threshold)?;
    let gallery = match gallery_dir {
        Some(dir) => Gallery::load(&dir, &mut matcher)?,
        None => Gallery::empty(),
    };

    let started = Instant::now();
    let detections = detector.infer(&frame)?;
    let faces = matcher.locate_and_match(&frame, &gallery)?;
    let elapsed = started.elapsed();

    let tally = ComplianceTally::from_detections(&detections);
    let mut per_label = BTreeMap::new();
    for det in &detections {
        *per_label.entry(det.class_name.as_str()).or_insert(0usize) += 1;
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "image": image.display().to_string(),
            "elapsed_ms": elapsed.as_millis() as u64,
            "classes": detector.class_names(),
            "match_threshold": matcher.threshold(),
            "counts": per_label,
            "compliance": tally,
            "violation": tally.is_violation(),
            "detections": detections,
            "faces": faces,
        }))?
    );

    if let Some((out, annotator)) = annotate {
        let annotated = annotator.annotate(&frame, &detections, &faces, false);
        annotated
            .save(&out)
            .with_context(|| format!("writing {}", out.display()))?;
        println!("Annotated frame written to {}", out.display());
    }
    Ok(())
}

fn list_gallery(dir: &std::path::Path, model_dir: &std::path::Path) -> Result<()> {
    let mut matcher = ArcFaceMatcher::load(
        &dir_str(model_dir),
        siteguard_core::face_matcher::DEFAULT_MATCH_THRESHOLD,
    )?;
    let gallery = Gallery::load(dir, &mut matcher)?;
    if gallery.is_empty() {
        println!("No encodings found in {}", dir.display());
        return Ok(());
    }
    for (identity, count) in gallery.encoding_counts() {
        println!("{identity:<24} {count} encoding(s)");
    }
    println!("{} encodings total", gallery.len());
    Ok(())
}

fn camera_test(device: &str, frames: u32) -> Result<()> {
    println!("Opening {device}...");
    let mut camera = Camera::open(device, &CaptureSettings::default())?;
    println!(
        "Negotiated {}x{} {:?}",
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let started = Instant::now();
    let mut captured = 0u32;
    let mut brightness = 0.0f64;
    while captured < frames {
        let Some(frame) = camera.next_frame() else {
            println!("Stream ended after {captured} frames");
            break;
        };
        let pixels = frame.image().as_raw();
        if !pixels.is_empty() {
            brightness += pixels.iter().map(|&p| p as f64).sum::<f64>() / pixels.len() as f64;
        }
        captured += 1;
    }
    camera.close();

    let elapsed = started.elapsed().max(Duration::from_millis(1));
    println!(
        "Captured {captured} frames in {:.2}s ({:.1} fps), mean brightness {:.1}",
        elapsed.as_secs_f64(),
        captured as f64 / elapsed.as_secs_f64(),
        if captured > 0 { brightness / captured as f64 } else { 0.0 }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_text_scale_defaults_and_parses() {
        let cli = Cli::try_parse_from(["siteguard", "detect", "site.jpg"]).unwrap();
        let Commands::Detect { text_scale, .. } = cli.command else {
            panic!("expected detect");
        };
        assert_eq!(text_scale, 2);

        let cli = Cli::try_parse_from(["siteguard", "detect", "site.jpg", "--text-scale", "0"])
            .unwrap();
        let Commands::Detect { text_scale, .. } = cli.command else {
            panic!("expected detect");
        };
        assert_eq!(FrameAnnotator::new(text_scale).text_scale, 1);
    }
}
