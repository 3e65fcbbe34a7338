use std::env;
use std::sync::OnceLock;

static TEFUSE_MIN_GROUP_SIZE: OnceLock<Option<usize>> = OnceLock::new();
static TEFUSE_CPU_FUSION: OnceLock<Option<bool>> = OnceLock::new();
static TEFUSE_GPU_FUSION: OnceLock<Option<bool>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn read_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

pub(crate) fn min_group_size() -> Option<usize> {
    *TEFUSE_MIN_GROUP_SIZE.get_or_init(|| {
        read_var("TEFUSE_MIN_GROUP_SIZE").and_then(|value| value.trim().parse().ok())
    })
}

pub(crate) fn cpu_fusion() -> Option<bool> {
    *TEFUSE_CPU_FUSION.get_or_init(|| read_var("TEFUSE_CPU_FUSION").map(|value| parse_bool(&value)))
}

pub(crate) fn gpu_fusion() -> Option<bool> {
    *TEFUSE_GPU_FUSION.get_or_init(|| read_var("TEFUSE_GPU_FUSION").map(|value| parse_bool(&value)))
}
