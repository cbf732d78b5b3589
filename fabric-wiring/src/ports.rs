use fabric_types::Port;
use log::warn;
use thiserror::Error;

/// Management port present on every switch, NIC ID 0.
pub const MANAGEMENT_PORT: &str = "M1";
/// Highest port ID handed out without complaint.
pub const PORT_SOFT_MAX: u8 = 48;
/// First breakout-capable port ID.
pub const BREAKOUT_PORT_MIN: u8 = 49;
/// Breakout-capable ports step by 4 lanes.
pub const BREAKOUT_PORT_STEP: u8 = 4;
/// No port ID past this exists on the profile.
pub const PORT_ID_MAX: u8 = 76;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PortError {
    /// NIC name not in any recognized form.
    #[error("invalid NIC ID: {0}")]
    InvalidNicId(String),

    /// Port pool of a device ran dry.
    #[error("no ports left on {device} (next would be {next}, max {max})")]
    Exhausted { device: String, next: u16, max: u16 },
}

/// Map a NIC name to its numeric ID.
///
/// Recognized forms: `M1` (the management port, ID 0), `E1/<N>` switch
/// ports, `enp2s<N>` server NICs, and the devlink physical-port form
/// `enp2s<N>np<M>` which collapses to its parent `N`.
pub fn nic_id(name: &str) -> Result<u8, PortError> {
    if name == MANAGEMENT_PORT {
        return Ok(0);
    }

    if let Some(rest) = name.strip_prefix("E1/") {
        return parse_id(name, rest);
    }

    if let Some(rest) = name.strip_prefix("enp2s") {
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return Err(PortError::InvalidNicId(name.to_string()));
        }
        let (id, suffix) = rest.split_at(digits);
        if !suffix.is_empty() {
            // Only a single devlink suffix collapses; anything else is junk.
            match suffix.strip_prefix("np") {
                Some(sub) if !sub.is_empty() && sub.bytes().all(|b| b.is_ascii_digit()) => {}
                _ => return Err(PortError::InvalidNicId(name.to_string())),
            }
        }
        return parse_id(name, id);
    }

    Err(PortError::InvalidNicId(name.to_string()))
}

fn parse_id(full: &str, digits: &str) -> Result<u8, PortError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PortError::InvalidNicId(full.to_string()));
    }
    digits
        .parse()
        .map_err(|_| PortError::InvalidNicId(full.to_string()))
}

/// Deterministic port pool of a single switch: `E1/1..E1/48` step 1, then
/// the breakout-capable pool `E1/49..E1/76` step 4. Handing out fabric
/// ports past `E1/48` logs a warning; past `E1/76` it is an error.
#[derive(Debug, Clone)]
pub struct SwitchPortAllocator {
    device: String,
    next: u16,
    next_breakout: u16,
}

impl SwitchPortAllocator {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            next: 1,
            next_breakout: BREAKOUT_PORT_MIN as u16,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn management(&self) -> Port {
        Port::new(&self.device, MANAGEMENT_PORT)
    }

    pub fn next(&mut self) -> Result<Port, PortError> {
        let id = self.next;
        if id > PORT_ID_MAX as u16 {
            return Err(PortError::Exhausted {
                device: self.device.clone(),
                next: id,
                max: PORT_ID_MAX as u16,
            });
        }
        if id > PORT_SOFT_MAX as u16 {
            warn!(
                "{}: allocating port E1/{} from the breakout range, topology is oversized",
                self.device, id
            );
        }
        self.next += 1;
        Ok(Port::new(&self.device, format!("E1/{}", id)))
    }

    pub fn next_breakout(&mut self) -> Result<Port, PortError> {
        let id = self.next_breakout;
        if id > PORT_ID_MAX as u16 {
            return Err(PortError::Exhausted {
                device: self.device.clone(),
                next: id,
                max: PORT_ID_MAX as u16,
            });
        }
        self.next_breakout += BREAKOUT_PORT_STEP as u16;
        Ok(Port::new(&self.device, format!("E1/{}", id)))
    }
}

/// Server and gateway NIC pool, `enp2s1..`. `enp2s0` is reserved for the
/// usernet SSH ingress and never handed out here.
#[derive(Debug, Clone)]
pub struct ServerNicAllocator {
    device: String,
    next: u8,
}

/// One NIC short of the 64-device PCI budget, `enp2s0` takes the first slot.
const SERVER_NIC_MAX: u8 = 63;

impl ServerNicAllocator {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            next: 1,
        }
    }

    pub fn next(&mut self) -> Result<Port, PortError> {
        let id = self.next;
        if id > SERVER_NIC_MAX {
            return Err(PortError::Exhausted {
                device: self.device.clone(),
                next: id as u16,
                max: SERVER_NIC_MAX as u16,
            });
        }
        self.next += 1;
        Ok(Port::new(&self.device, format!("enp2s{}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nic_id_accepts_known_forms() {
        assert_eq!(nic_id("M1"), Ok(0));
        assert_eq!(nic_id("E1/1"), Ok(1));
        assert_eq!(nic_id("E1/48"), Ok(48));
        assert_eq!(nic_id("E1/255"), Ok(255));
        assert_eq!(nic_id("enp2s0"), Ok(0));
        assert_eq!(nic_id("enp2s7"), Ok(7));
        assert_eq!(nic_id("enp2s255"), Ok(255));
        assert_eq!(nic_id("enp2s99np42"), Ok(99));
        assert_eq!(nic_id("enp2s3np0"), Ok(3));
    }

    #[test]
    fn test_nic_id_rejects_everything_else() {
        for bad in [
            "eth0",
            "eno0",
            "enp1s1",
            "E1/",
            "E1/1/1",
            "Management0",
            "enp2s99np42np1",
            "enp2s",
            "enp2snp1",
            "enp2s1np",
            "E1/x",
            "",
        ] {
            assert_eq!(
                nic_id(bad),
                Err(PortError::InvalidNicId(bad.to_string())),
                "expected {:?} to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_switch_pool_sequences() {
        let mut pool = SwitchPortAllocator::new("leaf-01");
        assert_eq!(pool.management().to_string(), "leaf-01/M1");
        assert_eq!(pool.next().expect("port").to_string(), "leaf-01/E1/1");
        assert_eq!(pool.next().expect("port").to_string(), "leaf-01/E1/2");

        assert_eq!(pool.next_breakout().expect("port").to_string(), "leaf-01/E1/49");
        assert_eq!(pool.next_breakout().expect("port").to_string(), "leaf-01/E1/53");
    }

    #[test]
    fn test_switch_pool_exhaustion() {
        let mut pool = SwitchPortAllocator::new("leaf-01");
        for _ in 0..PORT_ID_MAX {
            pool.next().expect("within pool");
        }
        let err = pool.next().expect_err("past E1/76");
        assert!(matches!(err, PortError::Exhausted { .. }));

        let mut pool = SwitchPortAllocator::new("leaf-02");
        // 49, 53, 57, 61, 65, 69, 73 all fit; 77 does not.
        for _ in 0..7 {
            pool.next_breakout().expect("breakout port");
        }
        assert!(pool.next_breakout().is_err());
    }

    #[test]
    fn test_server_nics_start_at_one() {
        let mut nics = ServerNicAllocator::new("server-01");
        assert_eq!(nics.next().expect("nic").to_string(), "server-01/enp2s1");
        assert_eq!(nics.next().expect("nic").to_string(), "server-01/enp2s2");
    }
}
