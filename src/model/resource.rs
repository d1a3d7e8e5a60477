use serde::{Deserialize, Serialize};

/// A CPU/memory pair. CPU is in milli-units (1000 = one core), memory in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub milli_cpu: i64,
    pub memory: i64,
}

impl Resource {
    pub const fn new(milli_cpu: i64, memory: i64) -> Self {
        Self { milli_cpu, memory }
    }

    pub const fn zero() -> Self {
        Self::new(0, 0)
    }

    /// Component-wise `self <= other`.
    pub fn fits_within(&self, other: &Resource) -> bool {
        self.milli_cpu <= other.milli_cpu && self.memory <= other.memory
    }

    /// Component-wise sum, `None` on overflow.
    pub fn checked_add(&self, other: &Resource) -> Option<Resource> {
        Some(Resource {
            milli_cpu: self.milli_cpu.checked_add(other.milli_cpu)?,
            memory: self.memory.checked_add(other.memory)?,
        })
    }

    /// Component-wise difference, clamped at zero.
    pub fn saturating_sub(&self, other: &Resource) -> Resource {
        Resource {
            milli_cpu: (self.milli_cpu - other.milli_cpu).max(0),
            memory: (self.memory - other.memory).max(0),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.milli_cpu == 0 && self.memory == 0
    }

    /// Both components are zero or more. Requests and capacities must be.
    pub fn is_non_negative(&self) -> bool {
        self.milli_cpu >= 0 && self.memory >= 0
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}m cpu / {} bytes", self.milli_cpu, self.memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_within_is_component_wise() {
        let cap = Resource::new(1000, 1024);
        assert!(Resource::new(1000, 1024).fits_within(&cap));
        assert!(Resource::new(10, 10).fits_within(&cap));
        assert!(!Resource::new(1001, 10).fits_within(&cap));
        assert!(!Resource::new(10, 1025).fits_within(&cap));
    }

    #[test]
    fn saturating_sub_never_goes_negative() {
        let a = Resource::new(100, 50);
        assert_eq!(a.saturating_sub(&Resource::new(30, 80)), Resource::new(70, 0));
    }

    #[test]
    fn checked_add_detects_overflow() {
        let a = Resource::new(i64::MAX, 0);
        assert!(a.checked_add(&Resource::new(1, 0)).is_none());
        assert_eq!(
            Resource::new(1, 2).checked_add(&Resource::new(3, 4)),
            Some(Resource::new(4, 6))
        );
    }

    #[test]
    fn negative_components_are_detected() {
        assert!(Resource::zero().is_non_negative());
        assert!(Resource::new(1, 0).is_non_negative());
        assert!(!Resource::new(-1, 10).is_non_negative());
        assert!(!Resource::new(10, -1).is_non_negative());
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let json = serde_json::to_value(Resource::new(100, 10240)).unwrap();
        assert_eq!(json["milli_cpu"], 100);
        assert_eq!(json["memory"], 10240);
    }
}
