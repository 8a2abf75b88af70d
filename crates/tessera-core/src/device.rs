use std::fmt;

/// Where an array's bytes live.
///
/// `Native` is the host-side peer backend; `Accel(i)` is accelerator `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Native,
    Accel(usize),
}

impl Device {
    pub fn is_native(&self) -> bool {
        matches!(self, Device::Native)
    }

    pub fn is_accel(&self) -> bool {
        matches!(self, Device::Accel(_))
    }

    /// Accelerator ordinal, if applicable.
    pub fn accel_index(&self) -> Option<usize> {
        match self {
            Device::Accel(idx) => Some(*idx),
            Device::Native => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Native => write!(f, "native"),
            Device::Accel(idx) => write!(f, "accel:{idx}"),
        }
    }
}
