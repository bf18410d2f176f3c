use serde::Deserialize;
use siteguard_core::AlertPolicy;
use siteguard_hw::{CaptureSettings, PixelFormat};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration.
///
/// Built from defaults, an optional TOML file named by `SITEGUARD_CONFIG`,
/// then `SITEGUARD_*` environment overrides, in that order.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Upper bound on a single frame wait; also bounds pipeline shutdown.
    pub capture_timeout_ms: u64,
    /// Requested FourCC: YUYV, MJPG or RGB3.
    pub capture_format: String,
    /// Directory containing `ppe.onnx`, `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// One sub-directory of reference images per identity.
    pub gallery_dir: PathBuf,
    /// PPE detector confidence threshold.
    pub confidence: f32,
    /// Cosine similarity required to name a face.
    pub match_threshold: f32,
    pub cooldown_secs: u64,
    pub banner_secs: u64,
    /// Per-viewer queue depth before the oldest frame is dropped.
    pub viewer_buffer: usize,
    /// Pending alert deliveries before new ones are rejected.
    pub notify_queue: usize,
    pub evidence_dir: PathBuf,
    /// File persisting the alert receiver address.
    pub receiver_file: PathBuf,
    /// Receiver used when nothing has been stored (`RECEIVER_EMAIL`).
    pub default_receiver: Option<String>,
    pub sender_email: Option<String>,
    pub email_password: Option<String>,
    pub smtp_host: String,
    pub smtp_port: u16,
    /// HTTP listen address.
    pub bind: String,
    /// Browser origin allowed by CORS.
    pub cors_origin: String,
    pub jpeg_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            capture_timeout_ms: 2000,
            capture_format: "YUYV".to_string(),
            model_dir: PathBuf::from("./models"),
            gallery_dir: PathBuf::from("./Person_Dataset"),
            confidence: 0.25,
            match_threshold: 0.40,
            cooldown_secs: 10,
            banner_secs: 3,
            viewer_buffer: 4,
            notify_queue: 8,
            evidence_dir: PathBuf::from("./evidence"),
            receiver_file: PathBuf::from(".receiver_email.txt"),
            default_receiver: None,
            sender_email: None,
            email_password: None,
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            bind: "0.0.0.0:5000".to_string(),
            cors_origin: "http://localhost:3000".to_string(),
            jpeg_quality: 80,
        }
    }
}

impl Config {
    /// Defaults overridden by `SITEGUARD_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Read the TOML file named by `SITEGUARD_CONFIG` (if any), then apply
    /// environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let Ok(path) = std::env::var("SITEGUARD_CONFIG") else {
            return Ok(Self::from_env());
        };
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Override fields from `lookup`. Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env(&lookup);
        env.string("SITEGUARD_CAMERA_DEVICE", &mut self.camera_device);
        env.parse("SITEGUARD_CAPTURE_WIDTH", &mut self.capture_width);
        env.parse("SITEGUARD_CAPTURE_HEIGHT", &mut self.capture_height);
        env.parse("SITEGUARD_CAPTURE_TIMEOUT_MS", &mut self.capture_timeout_ms);
        env.string("SITEGUARD_CAPTURE_FORMAT", &mut self.capture_format);
        env.path("SITEGUARD_MODEL_DIR", &mut self.model_dir);
        env.path("SITEGUARD_GALLERY_DIR", &mut self.gallery_dir);
        env.parse("SITEGUARD_CONFIDENCE", &mut self.confidence);
        env.parse("SITEGUARD_MATCH_THRESHOLD", &mut self.match_threshold);
        env.parse("SITEGUARD_COOLDOWN_SECS", &mut self.cooldown_secs);
        env.parse("SITEGUARD_BANNER_SECS", &mut self.banner_secs);
        env.parse("SITEGUARD_VIEWER_BUFFER", &mut self.viewer_buffer);
        env.parse("SITEGUARD_NOTIFY_QUEUE", &mut self.notify_queue);
        env.path("SITEGUARD_EVIDENCE_DIR", &mut self.evidence_dir);
        env.path("SITEGUARD_RECEIVER_FILE", &mut self.receiver_file);
        env.optional("RECEIVER_EMAIL", &mut self.default_receiver);
        env.optional("SENDER_EMAIL", &mut self.sender_email);
        env.optional("EMAIL_PASSWORD", &mut self.email_password);
        env.string("SITEGUARD_SMTP_HOST", &mut self.smtp_host);
        env.parse("SITEGUARD_SMTP_PORT", &mut self.smtp_port);
        env.string("SITEGUARD_BIND", &mut self.bind);
        env.string("SITEGUARD_CORS_ORIGIN", &mut self.cors_origin);
        env.parse("SITEGUARD_JPEG_QUALITY", &mut self.jpeg_quality);
    }

    pub fn ppe_model_path(&self) -> String {
        self.model_path("ppe.onnx")
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_path("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_path("w600k_r50.onnx")
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        let format = match self.capture_format.to_ascii_uppercase().as_str() {
            "MJPG" | "MJPEG" => PixelFormat::Mjpg,
            "RGB3" | "RGB" => PixelFormat::Rgb3,
            _ => PixelFormat::Yuyv,
        };
        CaptureSettings {
            width: self.capture_width,
            height: self.capture_height,
            format,
            timeout: Duration::from_millis(self.capture_timeout_ms),
        }
    }

    pub fn alert_policy(&self) -> AlertPolicy {
        AlertPolicy {
            cooldown: Duration::from_secs(self.cooldown_secs),
            banner: Duration::from_secs(self.banner_secs),
        }
    }

    /// SMTP credentials, when both are configured.
    pub fn smtp_credentials(&self) -> Option<(String, String)> {
        match (&self.sender_email, &self.email_password) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => {
                Some((user.clone(), pass.clone()))
            }
            _ => None,
        }
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, slot: &mut String) {
        if let Some(v) = self.get(key) {
            *slot = v;
        }
    }

    fn optional(&self, key: &str, slot: &mut Option<String>) {
        if let Some(v) = self.get(key) {
            *slot = Some(v);
        }
    }

    fn path(&self, key: &str, slot: &mut PathBuf) {
        if let Some(v) = self.get(key) {
            *slot = PathBuf::from(v);
        }
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, slot: &mut T) {
        if let Some(v) = self.get(key) {
            match v.parse() {
                Ok(parsed) => *slot = parsed,
                Err(_) => tracing::warn!(key, value = %v, "ignoring unparseable config value"),
            }
        }
    }
}
