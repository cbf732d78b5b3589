use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::CompileError;

/// ASN the fabric side presents to external BGP peers.
pub const FABRIC_ASN: u32 = 65102;
/// VRF table IDs are handed out monotonically from here.
pub const VRF_TABLE_BASE: u32 = 1000;

/// The `externals` block of the VLAB config: everything the external VM
/// template needs to speak BGP for all virtual externals at once.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ExternalsConfig {
    /// Per-external VRF blocks, external name -> VRF.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vrfs: BTreeMap<String, ExternalVrf>,
    /// Per-NIC attachment lists, NIC name on the external VM -> sessions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, Vec<NicAttachment>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ExternalVrf {
    pub table_id: u32,
    pub asn: u32,
    /// Communities are inverted relative to the fabric-side External
    /// object: what the fabric sends inbound, the external VM sees outbound.
    pub inbound_community: String,
    pub outbound_community: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct NicAttachment {
    /// Interface address of the external VM for this session.
    pub prefix: String,
    pub neighbor_ip: String,
    pub neighbor_asn: u32,
    /// Tagged sessions carry a VLAN; at most one untagged session per NIC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    pub vrf: String,
}

impl ExternalsConfig {
    /// Enforce the tagging rule on every NIC: mixing tagged and untagged
    /// sessions is an error, and so is more than one untagged session.
    pub fn check_tagging(&self) -> Result<(), CompileError> {
        for (nic, attachments) in &self.attachments {
            let untagged = attachments.iter().filter(|a| a.vlan.is_none()).count();
            if untagged > 1 {
                return Err(CompileError::MultipleUntagged { nic: nic.clone() });
            }
            if untagged > 0 && attachments.len() > untagged {
                return Err(CompileError::MixedTagging { nic: nic.clone() });
            }
        }
        Ok(())
    }
}
