//! Run configuration, built once at startup and shared read-only.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::task::Device;

pub const FFMPEG: &str = match option_env!("FFMPEG_PATH") {
    Some(path) => path,
    None => "ffmpeg",
};
pub const FFPROBE: &str = match option_env!("FFPROBE_PATH") {
    Some(path) => path,
    None => "ffprobe",
};
pub const VDNAGEN: &str = match option_env!("VDNAGEN_PATH") {
    Some(path) => path,
    None => "VDNAGen",
};

/// 1280x720.
pub const DEFAULT_COMPRESS_THRESHOLD: u64 = 1280 * 720;

/// A compression slot and how many jobs it may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSpec {
    pub device: Device,
    pub capacity: usize,
}

impl FromStr for DeviceSpec {
    type Err = String;

    /// Accepts `ID:CAPACITY` where `ID` is `-1`/`cpu` or a GPU index.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, capacity) = s
            .split_once(':')
            .ok_or_else(|| format!("expected ID:CAPACITY, got '{s}'"))?;
        let device = match id.trim() {
            "cpu" | "CPU" | "-1" => Device::Cpu,
            gpu => gpu
                .strip_prefix("gpu")
                .unwrap_or(gpu)
                .parse::<u32>()
                .map(Device::Gpu)
                .map_err(|_| format!("invalid device id '{id}'"))?,
        };
        let capacity = capacity
            .trim()
            .parse::<usize>()
            .map_err(|_| format!("invalid capacity '{capacity}'"))?;
        if capacity == 0 {
            return Err(format!("device {device} needs a capacity of at least 1"));
        }
        Ok(Self { device, capacity })
    }
}

/// An argv template with `{src}`, `{dst}`, `{gpu_id}` and `{codec}` placeholders.
///
/// The template is split on whitespace *before* substitution so paths
/// containing spaces stay a single argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate(Vec<String>);

#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub src: &'a str,
    pub dst: &'a str,
    pub gpu_id: Option<u32>,
    pub codec: &'a str,
}

impl CommandTemplate {
    pub fn new(template: &str) -> Self {
        Self(template.split_whitespace().map(str::to_string).collect())
    }

    pub fn render(&self, vars: &TemplateVars<'_>) -> Vec<String> {
        let gpu_id = vars.gpu_id.map(|id| id.to_string()).unwrap_or_default();
        self.0
            .iter()
            .map(|token| {
                token
                    .replace("{src}", vars.src)
                    .replace("{dst}", vars.dst)
                    .replace("{gpu_id}", &gpu_id)
                    .replace("{codec}", vars.codec)
            })
            .collect()
    }
}

impl FromStr for CommandTemplate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let template = Self::new(s);
        if template.0.is_empty() {
            return Err("command template is empty".to_string());
        }
        Ok(template)
    }
}

#[derive(Debug, Clone)]
pub struct CommandTemplates {
    pub cpu_compress: CommandTemplate,
    pub gpu_compress: CommandTemplate,
    pub fingerprint: CommandTemplate,
    pub probe_program: String,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            cpu_compress: CommandTemplate::new(&format!(
                "{FFMPEG} -i {{src}} -s 400:244 {{dst}}"
            )),
            gpu_compress: CommandTemplate::new(&format!(
                "{FFMPEG} -hwaccel_device {{gpu_id}} -hwaccel cuvid \
                 -c:v {{codec}}_cuvid -i {{src}} \
                 -c:v h264_nvenc -vf scale_npp=400:-2 -y {{dst}}"
            )),
            fingerprint: CommandTemplate::new(&format!("{VDNAGEN} {{src}} -o {{dst}}")),
            probe_program: FFPROBE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Empty means nothing is ever compressed.
    pub devices: Vec<DeviceSpec>,
    /// Pixel area above which a source is compressed first.
    pub compress_threshold: u64,
    pub compress_rebuild: bool,
    pub fingerprint_rebuild: bool,
    /// Fingerprint stage concurrency.
    pub workers: usize,
    pub cache_dir: PathBuf,
    pub poll_interval: Duration,
    pub templates: CommandTemplates,
}

impl PipelineConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            devices: Vec::new(),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            compress_rebuild: true,
            fingerprint_rebuild: true,
            workers: default_workers(),
            cache_dir: cache_dir.into(),
            poll_interval: Duration::from_secs(1),
            templates: CommandTemplates::default(),
        }
    }

    pub fn with_devices(mut self, devices: Vec<DeviceSpec>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Directory compressed intermediates are written under.
    pub fn compress_cache(&self) -> PathBuf {
        self.cache_dir.join("ffmpeg_compress")
    }

    /// Whether a `width`x`height` source has to go through compression.
    pub fn needs_compression(&self, width: i64, height: i64) -> bool {
        if self.devices.is_empty() || width <= 0 || height <= 0 {
            return false;
        }
        (self.compress_threshold as f64 / width as f64) < height as f64
    }
}

/// Two thirds of the available cores, plus one.
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    cores * 2 / 3 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_config() -> PipelineConfig {
        PipelineConfig::new("/tmp/cache").with_devices(vec![DeviceSpec {
            device: Device::Cpu,
            capacity: 2,
        }])
    }

    #[test]
    fn small_sources_are_not_compressed() {
        assert!(!cpu_config().needs_compression(400, 300));
    }

    #[test]
    fn uhd_sources_are_compressed() {
        assert!(cpu_config().needs_compression(3840, 2160));
    }

    #[test]
    fn bad_dimensions_are_never_compressed() {
        let config = cpu_config();
        assert!(!config.needs_compression(0, 2160));
        assert!(!config.needs_compression(3840, -1));
    }

    #[test]
    fn no_devices_means_no_compression() {
        let config = PipelineConfig::new("/tmp/cache");
        assert!(!config.needs_compression(3840, 2160));
    }

    #[test]
    fn parses_device_specs() {
        assert_eq!(
            "-1:2".parse::<DeviceSpec>().unwrap(),
            DeviceSpec { device: Device::Cpu, capacity: 2 }
        );
        assert_eq!(
            "cpu:4".parse::<DeviceSpec>().unwrap(),
            DeviceSpec { device: Device::Cpu, capacity: 4 }
        );
        assert_eq!(
            "2:7".parse::<DeviceSpec>().unwrap(),
            DeviceSpec { device: Device::Gpu(2), capacity: 7 }
        );
        assert!("0".parse::<DeviceSpec>().is_err());
        assert!("0:0".parse::<DeviceSpec>().is_err());
        assert!("x:1".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn templates_keep_paths_with_spaces_whole() {
        let tpl = CommandTemplate::new(
            "ffmpeg -c:v {codec}_cuvid -hwaccel_device {gpu_id} -i {src} {dst}",
        );
        let argv = tpl.render(&TemplateVars {
            src: "/media/My Movie.mkv",
            dst: "/tmp/out dir/My Movie.mkv",
            gpu_id: Some(1),
            codec: "h264",
        });
        assert_eq!(
            argv,
            vec![
                "ffmpeg",
                "-c:v",
                "h264_cuvid",
                "-hwaccel_device",
                "1",
                "-i",
                "/media/My Movie.mkv",
                "/tmp/out dir/My Movie.mkv",
            ]
        );
    }

    #[test]
    fn workers_never_drop_below_one() {
        assert_eq!(PipelineConfig::new("/tmp").with_workers(0).workers, 1);
    }
}
