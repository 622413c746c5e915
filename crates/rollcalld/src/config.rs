use rollcall_core::{
    DetectorModels, DetectorSettings, EncoderKind, EnrollmentSettings, FaceEncoder,
    ARCFACE_MODEL_FILE, CASCADE_MODEL_FILE, SCRFD_MODEL_FILE,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration: defaults, then the TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device index (`/dev/videoN`).
    pub camera_index: u32,
    /// Normalised distance below which a nearest match is accepted. Unset
    /// uses the active encoder's default.
    pub match_threshold: Option<f32>,
    /// Minimum minutes between two accepted events for one subject.
    pub cooldown_minutes: u64,
    /// Samples captured per enrollment.
    pub enrollment_target: usize,
    pub detection_confidence: f32,
    /// Minimum face width and height in pixels.
    pub min_face_size: u32,
    /// Consecutive frames a subject must be matched before the cooldown check.
    pub stability_frames: u32,
    /// Minimum Laplacian variance for enrollment samples; unset disables the gate.
    pub blur_threshold: Option<f64>,
    pub recognition_interval_ms: u64,
    pub enrollment_interval_ms: u64,
    pub encoder: EncoderKind,
    /// Directory containing model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = rollcall_core::data_home().join("rollcall");
        Self {
            camera_index: 0,
            match_threshold: None,
            cooldown_minutes: 5,
            enrollment_target: 80,
            detection_confidence: 0.7,
            min_face_size: 100,
            stability_frames: 1,
            blur_threshold: None,
            recognition_interval_ms: 100,
            enrollment_interval_ms: 100,
            encoder: EncoderKind::Pixel,
            model_dir: rollcall_core::default_model_dir(),
            db_path: data_dir.join("rollcall.db"),
        }
    }
}

impl Config {
    /// Load from the config file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "read config file");
                Some(text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        Self::from_sources(text.as_deref(), |key| std::env::var(key).ok())
    }

    /// Build from optional TOML text and an environment lookup.
    pub fn from_sources<E>(file: Option<&str>, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let mut config: Config = match file {
            Some(text) => toml::from_str(text)?,
            None => Config::default(),
        };

        override_from(&env, "ROLLCALL_CAMERA_INDEX", &mut config.camera_index);
        override_from(&env, "ROLLCALL_COOLDOWN_MINUTES", &mut config.cooldown_minutes);
        override_from(&env, "ROLLCALL_ENROLLMENT_TARGET", &mut config.enrollment_target);
        override_from(&env, "ROLLCALL_DETECTION_CONFIDENCE", &mut config.detection_confidence);
        override_from(&env, "ROLLCALL_MIN_FACE_SIZE", &mut config.min_face_size);
        override_from(&env, "ROLLCALL_STABILITY_FRAMES", &mut config.stability_frames);
        override_from(&env, "ROLLCALL_RECOGNITION_INTERVAL_MS", &mut config.recognition_interval_ms);
        override_from(&env, "ROLLCALL_ENROLLMENT_INTERVAL_MS", &mut config.enrollment_interval_ms);
        if let Some(raw) = env("ROLLCALL_MATCH_THRESHOLD") {
            match raw.trim().parse::<f32>() {
                Ok(v) => config.match_threshold = Some(v),
                Err(_) => warn_unparsed("ROLLCALL_MATCH_THRESHOLD", &raw),
            }
        }
        if let Some(raw) = env("ROLLCALL_BLUR_THRESHOLD") {
            match raw.parse::<f64>() {
                Ok(v) => config.blur_threshold = Some(v),
                Err(_) => warn_unparsed("ROLLCALL_BLUR_THRESHOLD", &raw),
            }
        }
        if let Some(raw) = env("ROLLCALL_ENCODER") {
            match raw.to_ascii_lowercase().as_str() {
                "pixel" => config.encoder = EncoderKind::Pixel,
                "arcface" => config.encoder = EncoderKind::Arcface,
                _ => warn_unparsed("ROLLCALL_ENCODER", &raw),
            }
        }
        if let Some(dir) = env("ROLLCALL_MODEL_DIR") {
            config.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = env("ROLLCALL_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(threshold) = self.match_threshold {
            if threshold.is_nan() || threshold <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "match_threshold must be > 0, got {threshold}"
                )));
            }
        }
        if self.enrollment_target < 1 {
            return Err(ConfigError::Invalid("enrollment_target must be >= 1".into()));
        }
        if self.stability_frames < 1 {
            return Err(ConfigError::Invalid("stability_frames must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.detection_confidence) {
            return Err(ConfigError::Invalid(format!(
                "detection_confidence must be within [0, 1], got {}",
                self.detection_confidence
            )));
        }
        Ok(())
    }

    /// Threshold for the encoder actually in use.
    ///
    /// A configured threshold at or above the encoder's distance bound would
    /// accept every face, so it is rejected.
    pub fn match_threshold_for(&self, encoder: &dyn FaceEncoder) -> Result<f32, ConfigError> {
        let Some(threshold) = self.match_threshold else {
            return Ok(encoder.default_threshold());
        };
        match encoder.max_distance() {
            Some(bound) if threshold >= bound => Err(ConfigError::Invalid(format!(
                "match_threshold {threshold} accepts every face with the {} encoder \
                 (distances never exceed {bound}); try {}",
                encoder.name(),
                encoder.default_threshold()
            ))),
            _ => Ok(threshold),
        }
    }

    pub fn detector_models(&self) -> DetectorModels {
        DetectorModels {
            primary: self.model_dir.join(SCRFD_MODEL_FILE),
            fallback: self.model_dir.join(CASCADE_MODEL_FILE),
        }
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            confidence_threshold: self.detection_confidence,
            min_face_size: self.min_face_size,
        }
    }

    pub fn enrollment_settings(&self) -> EnrollmentSettings {
        EnrollmentSettings {
            target_samples: self.enrollment_target,
            blur_threshold: self.blur_threshold,
        }
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join(ARCFACE_MODEL_FILE)
    }

    pub fn cooldown_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cooldown_minutes.min(i64::MAX as u64 / 60_000) as i64)
    }

    pub fn recognition_interval(&self) -> Duration {
        Duration::from_millis(self.recognition_interval_ms)
    }

    pub fn enrollment_interval(&self) -> Duration {
        Duration::from_millis(self.enrollment_interval_ms)
    }

    /// Directory for enrollment profile photos, next to the database.
    pub fn photo_dir(&self) -> PathBuf {
        self.db_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("photos")
    }
}

/// `$ROLLCALL_CONFIG`, else `$XDG_CONFIG_HOME/rollcall/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("ROLLCALL_CONFIG") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("rollcall")
        .join("config.toml")
}

fn override_from<E, T>(env: &E, key: &str, slot: &mut T)
where
    E: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = env(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => warn_unparsed(key, &raw),
        }
    }
}

fn warn_unparsed(key: &str, raw: &str) {
    tracing::warn!(key, value = raw, "ignoring unparseable environment override");
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use rollcall_core::encoder::EncoderError;
    use rollcall_core::{Encoding, PixelEncoder};
    use std::collections::HashMap;

    /// Unit-length 512-dim embeddings, as a learned encoder produces.
    struct UnitEncoder;

    impl FaceEncoder for UnitEncoder {
        fn encode(&mut self, _face: &GrayImage) -> Result<Encoding, EncoderError> {
            Err(EncoderError::EmptyCrop)
        }

        fn dimension(&self) -> usize {
            512
        }

        fn name(&self) -> &'static str {
            "unit"
        }

        fn default_threshold(&self) -> f32 {
            1.1 / 512.0
        }

        fn max_distance(&self) -> Option<f32> {
            Some(2.0 / 512.0)
        }
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(None, env(&[])).unwrap();
        assert_eq!(config.camera_index, 0);
        assert_eq!(config.match_threshold, None);
        assert_eq!(config.cooldown_minutes, 5);
        assert_eq!(config.enrollment_target, 80);
        assert!((config.detection_confidence - 0.7).abs() < 1e-6);
        assert_eq!(config.min_face_size, 100);
        assert_eq!(config.stability_frames, 1);
        assert_eq!(config.blur_threshold, None);
        assert_eq!(config.encoder, EncoderKind::Pixel);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let text = r#"
            camera_index = 2
            cooldown_minutes = 10
            blur_threshold = 35.5
            encoder = "arcface"
        "#;
        let config = Config::from_sources(Some(text), env(&[])).unwrap();
        assert_eq!(config.camera_index, 2);
        assert_eq!(config.cooldown_minutes, 10);
        assert_eq!(config.blur_threshold, Some(35.5));
        assert_eq!(config.encoder, EncoderKind::Arcface);
        assert_eq!(config.enrollment_target, 80);
    }

    #[test]
    fn test_env_overrides_file() {
        let config = Config::from_sources(
            Some("camera_index = 2\nmin_face_size = 80"),
            env(&[
                ("ROLLCALL_CAMERA_INDEX", "4"),
                ("ROLLCALL_MODEL_DIR", "/opt/models"),
            ]),
        )
        .unwrap();
        assert_eq!(config.camera_index, 4);
        assert_eq!(config.min_face_size, 80);
        assert_eq!(config.detector_models().primary, PathBuf::from("/opt/models/det_10g.onnx"));
    }

    #[test]
    fn test_unparseable_env_keeps_lower_layer() {
        let config = Config::from_sources(
            Some("cooldown_minutes = 7"),
            env(&[("ROLLCALL_COOLDOWN_MINUTES", "soon"), ("ROLLCALL_ENCODER", "hog")]),
        )
        .unwrap();
        assert_eq!(config.cooldown_minutes, 7);
        assert_eq!(config.encoder, EncoderKind::Pixel);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let err = Config::from_sources(Some("camera_index = \"two\""), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation() {
        for (key, value) in [
            ("ROLLCALL_MATCH_THRESHOLD", "0"),
            ("ROLLCALL_ENROLLMENT_TARGET", "0"),
            ("ROLLCALL_STABILITY_FRAMES", "0"),
            ("ROLLCALL_DETECTION_CONFIDENCE", "1.5"),
        ] {
            let err = Config::from_sources(None, env(&[(key, value)])).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{key}={value}");
        }
    }

    #[test]
    fn test_unset_threshold_follows_encoder() {
        let config = Config::from_sources(None, env(&[])).unwrap();
        assert_eq!(config.match_threshold_for(&PixelEncoder::new()).unwrap(), 0.4);
        assert_eq!(config.match_threshold_for(&UnitEncoder).unwrap(), 1.1 / 512.0);
    }

    #[test]
    fn test_threshold_that_accepts_everything_rejected() {
        let config =
            Config::from_sources(Some("match_threshold = 0.4"), env(&[])).unwrap();
        assert!(matches!(
            config.match_threshold_for(&UnitEncoder),
            Err(ConfigError::Invalid(_))
        ));
        assert_eq!(config.match_threshold_for(&PixelEncoder::new()).unwrap(), 0.4);

        let config = Config::from_sources(None, env(&[("ROLLCALL_MATCH_THRESHOLD", "0.003")]))
            .unwrap();
        assert_eq!(config.match_threshold, Some(0.003));
        assert_eq!(config.match_threshold_for(&UnitEncoder).unwrap(), 0.003);

        // Orthogonal unit embeddings stay apart under the accepted threshold.
        let mut a = vec![0.0f32; 512];
        let mut b = vec![0.0f32; 512];
        a[0] = 1.0;
        b[1] = 1.0;
        let distance = Encoding::new(a).distance(&Encoding::new(b)).unwrap();
        let threshold = Config::from_sources(None, env(&[]))
            .unwrap()
            .match_threshold_for(&UnitEncoder)
            .unwrap();
        assert!(distance >= threshold);
    }

    #[test]
    fn test_cooldown_window() {
        let config = Config::from_sources(Some("cooldown_minutes = 3"), env(&[])).unwrap();
        assert_eq!(config.cooldown_window(), chrono::Duration::minutes(3));
    }

    #[test]
    fn test_photo_dir_next_to_database() {
        let config = Config::from_sources(None, env(&[("ROLLCALL_DB_PATH", "/var/lib/rollcall/db.sqlite")]))
            .unwrap();
        assert_eq!(config.photo_dir(), PathBuf::from("/var/lib/rollcall/photos"));
    }
}
