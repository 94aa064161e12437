//! Numeric precision policy for the GEMM path
//!
//! The reduced-precision mode for f32 GEMMs is a process-wide setting read
//! once from `STRATA_FP32_MATH_MODE`. Individual GEMMs can opt out through
//! [`ComputePrecision::Highest`].

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Environment variable holding the process-wide fp32 math mode.
pub const FP32_MATH_MODE_ENV: &str = "STRATA_FP32_MATH_MODE";

/// How much precision an f32 matmul may trade for throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fp32MathMode {
    /// Full f32 inputs and accumulation
    #[default]
    Strict,
    /// Inputs may be rounded to TF32 (10-bit mantissa)
    Tf32,
    /// Inputs may be rounded to bf16
    Bf16,
    /// Inputs may be rounded to f16
    F16,
    /// Any of the above, at the backend's discretion
    Any,
}

impl Fp32MathMode {
    /// Process-wide default, read from [`FP32_MATH_MODE_ENV`] on first use.
    ///
    /// Unknown values fall back to [`Fp32MathMode::Strict`].
    #[must_use]
    pub fn process_default() -> Self {
        static MODE: OnceLock<Fp32MathMode> = OnceLock::new();
        *MODE.get_or_init(Self::from_env)
    }

    /// Read the mode from the environment without caching.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var(FP32_MATH_MODE_ENV) {
            Ok(value) => value.parse().unwrap_or_else(|_| {
                tracing::warn!(
                    "{FP32_MATH_MODE_ENV}={value:?} is not a known fp32 math mode, using strict"
                );
                Self::Strict
            }),
            Err(_) => Self::Strict,
        }
    }
}

impl FromStr for Fp32MathMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "tf32" => Ok(Self::Tf32),
            "bf16" => Ok(Self::Bf16),
            "f16" => Ok(Self::F16),
            "any" => Ok(Self::Any),
            other => Err(format!("unknown fp32 math mode: {other}")),
        }
    }
}

impl fmt::Display for Fp32MathMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Strict => "strict",
            Self::Tf32 => "tf32",
            Self::Bf16 => "bf16",
            Self::F16 => "f16",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

/// Per-GEMM precision request from the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputePrecision {
    #[default]
    Default,
    High,
    /// Never use reduced precision
    Highest,
}

impl ComputePrecision {
    /// Resolve the fp32 math mode for a GEMM with this precision request.
    #[must_use]
    pub fn fp32_math_mode(self, process_default: Fp32MathMode) -> Fp32MathMode {
        match self {
            Self::Highest => Fp32MathMode::Strict,
            Self::Default | Self::High => process_default,
        }
    }
}
