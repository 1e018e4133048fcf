use serde::{Deserialize, Serialize};

/// Length of a VmId.
pub const VM_ID_LEN: usize = 8;

/// Short identifier derived from a run id.
///
/// Names the VM work directory and sockets and shows up in the Firecracker
/// command line, so it is the join key between scheduler state, pool
/// entries, and processes found on the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(String);

impl VmId {
    /// The first eight hex digits of a UUID run id. Any other run id maps
    /// to the FNV-1a hash of the whole id, so ids sharing a prefix differ.
    pub fn from_run_id(run_id: &str) -> Self {
        let n = match uuid::Uuid::parse_str(run_id) {
            Ok(uuid) => uuid.as_fields().0,
            Err(_) => run_id.bytes().fold(0x811c_9dc5u32, |h, b| {
                (h ^ b as u32).wrapping_mul(0x0100_0193)
            }),
        };
        Self(format!("{:0width$x}", n, width = VM_ID_LEN))
    }

    /// Accept an existing VmId (e.g. parsed from a process command line).
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == VM_ID_LEN
            && s
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
