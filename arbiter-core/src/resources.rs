//! Resource vectors & Kubernetes quantity handling.
//!
//! Arbiter tracks two resource dimensions: CPU, measured in millicores, and memory, measured in
//! bytes. Quantities are parsed exactly with 128-bit integer arithmetic and any fractional
//! remainder is rounded up to the next whole unit, mirroring how the Kubernetes API server
//! canonicalizes sub-unit values.
//!
//! References:
//! - https://kubernetes.io/docs/reference/kubernetes-api/common-definitions/quantity/

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::AppError;

/// The canonical name of the CPU resource.
pub const RESOURCE_CPU: &str = "cpu";
/// The canonical name of the memory resource.
pub const RESOURCE_MEMORY: &str = "memory";

const KI: i64 = 1 << 10;
const MI: i64 = 1 << 20;
const GI: i64 = 1 << 30;

/// A vector of the resource dimensions tracked by Arbiter.
///
/// A dimension which is absent from a source resource map is treated as zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourceVector {
    /// CPU in millicores.
    pub cpu: i64,
    /// Memory in bytes.
    pub memory: i64,
}

impl ResourceVector {
    /// Create a new instance from millicores & bytes.
    pub const fn new(cpu: i64, memory: i64) -> Self {
        Self { cpu, memory }
    }

    /// Build a vector from raw cpu & memory quantity strings, where `None` is zero.
    pub fn from_raw(cpu: Option<&str>, memory: Option<&str>) -> Result<Self, AppError> {
        let cpu = cpu.map(parse_cpu).transpose()?.unwrap_or(0);
        let memory = memory.map(parse_memory).transpose()?.unwrap_or(0);
        Ok(Self { cpu, memory })
    }

    /// Build a vector from a K8s resource list, reading the given keys.
    pub fn from_quantities(map: &BTreeMap<String, Quantity>, cpu_key: &str, memory_key: &str) -> Result<Self, AppError> {
        Self::from_raw(map.get(cpu_key).map(|q| q.0.as_str()), map.get(memory_key).map(|q| q.0.as_str()))
    }

    /// Build a vector from a K8s resource list using the canonical `cpu` & `memory` keys.
    pub fn from_resource_list(map: &BTreeMap<String, Quantity>) -> Result<Self, AppError> {
        Self::from_quantities(map, RESOURCE_CPU, RESOURCE_MEMORY)
    }

    /// Build a vector from a map of plain quantity strings, as found in Queue statuses.
    pub fn from_strings(map: &BTreeMap<String, String>) -> Result<Self, AppError> {
        Self::from_raw(map.get(RESOURCE_CPU).map(String::as_str), map.get(RESOURCE_MEMORY).map(String::as_str))
    }

    /// Render this vector as a map of canonical quantity strings.
    pub fn to_strings(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(RESOURCE_CPU.into(), format_cpu(self.cpu));
        map.insert(RESOURCE_MEMORY.into(), format_memory(self.memory));
        map
    }

    /// Render this vector as a K8s resource list under the given keys.
    pub fn to_quantities(&self, cpu_key: &str, memory_key: &str) -> BTreeMap<String, Quantity> {
        let mut map = BTreeMap::new();
        map.insert(cpu_key.into(), Quantity(format_cpu(self.cpu)));
        map.insert(memory_key.into(), Quantity(format_memory(self.memory)));
        map
    }

    /// True if every dimension of `self` is less than or equal to the same dimension of `other`.
    pub fn is_under(&self, other: &Self) -> bool {
        self.cpu <= other.cpu && self.memory <= other.memory
    }

    /// True if any dimension is greater than zero.
    pub fn any_positive(&self) -> bool {
        self.cpu > 0 || self.memory > 0
    }

    /// True if all dimensions are zero.
    pub fn is_zero(&self) -> bool {
        self.cpu == 0 && self.memory == 0
    }

    /// Replace negative dimensions with zero.
    pub fn clamp_non_negative(self) -> Self {
        Self::new(self.cpu.max(0), self.memory.max(0))
    }

    /// The per-dimension minimum of the two vectors.
    pub fn min(&self, other: &Self) -> Self {
        Self::new(self.cpu.min(other.cpu), self.memory.min(other.memory))
    }

    /// The per-dimension maximum of the two vectors.
    pub fn max(&self, other: &Self) -> Self {
        Self::new(self.cpu.max(other.cpu), self.memory.max(other.memory))
    }
}

impl Add for ResourceVector {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.cpu.saturating_add(rhs.cpu), self.memory.saturating_add(rhs.memory))
    }
}

impl AddAssign for ResourceVector {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for ResourceVector {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.cpu.saturating_sub(rhs.cpu), self.memory.saturating_sub(rhs.memory))
    }
}

impl SubAssign for ResourceVector {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl std::iter::Sum for ResourceVector {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, val| acc + val)
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={} memory={}", format_cpu(self.cpu), format_memory(self.memory))
    }
}

/// Parse a CPU quantity into millicores.
pub fn parse_cpu(raw: &str) -> Result<i64, AppError> {
    parse_scaled(raw, 1000)
}

/// Parse a memory quantity into bytes.
pub fn parse_memory(raw: &str) -> Result<i64, AppError> {
    parse_scaled(raw, 1)
}

/// Format millicores as a canonical CPU quantity.
pub fn format_cpu(millis: i64) -> String {
    if millis % 1000 == 0 {
        format!("{}", millis / 1000)
    } else {
        format!("{}m", millis)
    }
}

/// Format bytes as a canonical memory quantity, preferring binary suffixes.
pub fn format_memory(bytes: i64) -> String {
    for (unit, suffix) in [(GI, "Gi"), (MI, "Mi"), (KI, "Ki")] {
        if bytes != 0 && bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}

/// A quantity suffix multiplier.
enum Multiplier {
    /// A power of ten.
    Decimal(i32),
    /// A power of two.
    Binary(u32),
}

impl Multiplier {
    fn from_suffix(suffix: &str) -> Option<Self> {
        let multiplier = match suffix {
            "" => Self::Decimal(0),
            "n" => Self::Decimal(-9),
            "u" => Self::Decimal(-6),
            "m" => Self::Decimal(-3),
            "k" => Self::Decimal(3),
            "M" => Self::Decimal(6),
            "G" => Self::Decimal(9),
            "T" => Self::Decimal(12),
            "P" => Self::Decimal(15),
            "E" => Self::Decimal(18),
            "Ki" => Self::Binary(10),
            "Mi" => Self::Binary(20),
            "Gi" => Self::Binary(30),
            "Ti" => Self::Binary(40),
            "Pi" => Self::Binary(50),
            "Ei" => Self::Binary(60),
            _ => {
                let exp = suffix.strip_prefix('e').or_else(|| suffix.strip_prefix('E'))?;
                Self::Decimal(exp.parse().ok()?)
            }
        };
        Some(multiplier)
    }
}

/// Parse the given quantity, multiply it by `scale` and round up to a whole number.
fn parse_scaled(raw: &str, scale: i128) -> Result<i64, AppError> {
    let err = |reason: &'static str| AppError::InvalidQuantity(raw.to_string(), reason);
    let value = raw.trim();
    if value.starts_with('-') {
        return Err(err("negative quantities are not supported"));
    }
    let value = value.strip_prefix('+').unwrap_or(value);

    let split = value.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(err("missing numeric value"));
    }
    if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err("malformed numeric value"));
    }

    let mut numerator: i128 = 0;
    for digit in int_part.bytes().chain(frac_part.bytes()) {
        numerator = numerator
            .checked_mul(10)
            .and_then(|val| val.checked_add(i128::from(digit - b'0')))
            .ok_or_else(|| err("value out of range"))?;
    }
    let mut denominator = pow10(frac_part.len() as u32).ok_or_else(|| err("value out of range"))?;

    match Multiplier::from_suffix(suffix).ok_or_else(|| err("unknown suffix"))? {
        Multiplier::Decimal(exp) if exp >= 0 => {
            numerator = pow10(exp as u32)
                .and_then(|mul| numerator.checked_mul(mul))
                .ok_or_else(|| err("value out of range"))?;
        }
        Multiplier::Decimal(exp) => {
            denominator = pow10(exp.unsigned_abs())
                .and_then(|mul| denominator.checked_mul(mul))
                .ok_or_else(|| err("value out of range"))?;
        }
        Multiplier::Binary(bits) => {
            numerator = numerator.checked_mul(1i128 << bits).ok_or_else(|| err("value out of range"))?;
        }
    }

    let scaled = numerator.checked_mul(scale).ok_or_else(|| err("value out of range"))?;
    let rounded = scaled / denominator + i128::from(scaled % denominator != 0);
    i64::try_from(rounded).map_err(|_| err("value out of range"))
}

fn pow10(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}
