//! Static table of the physical-layer modes the range test can run on.
//!
//! Every PHY belongs to one frame family. The family decides the frame layout on air
//! and therefore the payload length bounds, the channel range and the defaults that
//! are re-derived whenever the operator switches PHY.

use core::fmt::Write;

use crate::messages::PAYLOAD_LEN_MIN;

/// Index of a PHY in [`PHY_TABLE`].
pub type PhyId = u8;

/// BLE advertising PDU and IEEE 802.15.4 payload caps.
pub const BLE_PAYLOAD_LEN_MAX: u8 = 24;
pub const IEEE802154_PAYLOAD_LEN_MAX: u8 = 24;

/// First BLE physical channel used by the test.
pub const BLE_PHYSICAL_CHANNEL: u16 = 0;
/// First 2.4 GHz IEEE 802.15.4 channel.
pub const IEEE802154_CHANNEL: u16 = 11;

/// Every PHY runs on the same centre frequency.
pub const PHY_FREQUENCY_MHZ: u16 = 2450;

/// Transmit power limits and step, in 0.1 dBm.
pub const TX_POWER_MAX: i16 = 200;
pub const TX_POWER_MIN: i16 = -150;
pub const TX_POWER_INC: i16 = 5;

/// Frame family carried by a PHY.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFamily {
    /// Non-connectable BLE advertising PDUs over the BLE link layer PHYs.
    Ble,
    /// IEEE 802.15.4 data frames.
    Ieee802154,
}

impl FrameFamily {
    pub const fn payload_len_max(self) -> u8 {
        match self {
            FrameFamily::Ble => BLE_PAYLOAD_LEN_MAX,
            FrameFamily::Ieee802154 => IEEE802154_PAYLOAD_LEN_MAX,
        }
    }

    pub const fn default_channel(self) -> u16 {
        match self {
            FrameFamily::Ble => BLE_PHYSICAL_CHANNEL,
            FrameFamily::Ieee802154 => IEEE802154_CHANNEL,
        }
    }

    /// Inclusive channel range supported by the family's channel plan.
    pub const fn channel_range(self) -> (u16, u16) {
        match self {
            FrameFamily::Ble => (0, 39),
            FrameFamily::Ieee802154 => (11, 26),
        }
    }

    /// Power the radio settles to after the PHY is configured, in 0.1 dBm.
    pub const fn default_tx_power(self) -> i16 {
        match self {
            FrameFamily::Ble => 100,
            FrameFamily::Ieee802154 => 80,
        }
    }
}

/// Read-only description of one PHY.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhyDescriptor {
    pub id: PhyId,
    pub name: &'static str,
    pub supported: bool,
    pub family: FrameFamily,
}

impl PhyDescriptor {
    pub const fn payload_len_range(&self) -> (u8, u8) {
        (PAYLOAD_LEN_MIN, self.family.payload_len_max())
    }
}

pub const PHY_BLE_1MBPS: PhyId = 0;
pub const PHY_BLE_2MBPS: PhyId = 1;
pub const PHY_BLE_125KBPS: PhyId = 2;
pub const PHY_BLE_500KBPS: PhyId = 3;
pub const PHY_IEEE_802154: PhyId = 4;

/// PHY selected at power-up.
pub const PHY_DEFAULT: PhyId = PHY_IEEE_802154;

pub static PHY_TABLE: [PhyDescriptor; 5] = [
    PhyDescriptor {
        id: PHY_BLE_1MBPS,
        name: "BLE 1Mbps",
        supported: true,
        family: FrameFamily::Ble,
    },
    PhyDescriptor {
        id: PHY_BLE_2MBPS,
        name: "BLE 2Mbps",
        supported: true,
        family: FrameFamily::Ble,
    },
    PhyDescriptor {
        id: PHY_BLE_125KBPS,
        name: "BLE 125kbps",
        supported: true,
        family: FrameFamily::Ble,
    },
    PhyDescriptor {
        id: PHY_BLE_500KBPS,
        name: "BLE 500kbps",
        supported: true,
        family: FrameFamily::Ble,
    },
    PhyDescriptor {
        id: PHY_IEEE_802154,
        name: "IEEE 802.15.4",
        supported: true,
        family: FrameFamily::Ieee802154,
    },
];

/// Looks up a PHY by id.
pub fn descriptor(id: PhyId) -> Option<&'static PhyDescriptor> {
    PHY_TABLE.get(id as usize)
}

/// Looks up a PHY that can actually be selected.
pub fn supported(id: PhyId) -> Option<&'static PhyDescriptor> {
    descriptor(id).filter(|phy| phy.supported)
}

/// Next supported PHY after `current`, wrapping. Returns `current` when it is the only one.
pub fn next_supported(current: PhyId) -> PhyId {
    let count = PHY_TABLE.len();
    let mut index = current as usize % count;
    for _ in 0..count {
        index = (index + 1) % count;
        if PHY_TABLE[index].supported {
            return index as PhyId;
        }
    }
    current
}

/// Maximum size of the rendered PHY list.
pub const PHY_LIST_CAPACITY: usize = 96;

/// Renders the `"id:name,"` list of supported PHYs exposed to the remote observer.
pub fn phy_list() -> heapless::String<PHY_LIST_CAPACITY> {
    let mut list = heapless::String::new();
    for phy in PHY_TABLE.iter().filter(|phy| phy.supported) {
        if write!(list, "{}:{},", phy.id, phy.name).is_err() {
            log::warn!("PHY list truncated at id {}", phy.id);
            break;
        }
    }
    list
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_default_and_it_is_supported() {
        assert!(supported(PHY_DEFAULT).is_some());
        assert_eq!(PHY_TABLE.iter().filter(|phy| phy.id == PHY_DEFAULT).count(), 1);
    }

    #[test]
    fn table_ids_match_positions() {
        for (index, phy) in PHY_TABLE.iter().enumerate() {
            assert_eq!(phy.id as usize, index);
        }
    }

    #[test]
    fn next_supported_wraps() {
        assert_eq!(next_supported(PHY_BLE_1MBPS), PHY_BLE_2MBPS);
        assert_eq!(next_supported(PHY_IEEE_802154), PHY_BLE_1MBPS);
    }

    #[test]
    fn payload_bounds_follow_family() {
        let ble = descriptor(PHY_BLE_2MBPS).map(|phy| phy.payload_len_range());
        assert_eq!(ble, Some((5, BLE_PAYLOAD_LEN_MAX)));
        let ieee = descriptor(PHY_IEEE_802154).map(|phy| phy.payload_len_range());
        assert_eq!(ieee, Some((5, IEEE802154_PAYLOAD_LEN_MAX)));
    }

    #[test]
    fn defaults_are_on_the_power_grid() {
        for family in [FrameFamily::Ble, FrameFamily::Ieee802154] {
            assert_eq!(family.default_tx_power() % TX_POWER_INC, 0);
            let (first, last) = family.channel_range();
            assert!(first <= family.default_channel() && family.default_channel() <= last);
        }
    }

    #[test]
    fn phy_list_renders_every_supported_phy() {
        let list = phy_list();
        assert_eq!(list.as_str(), "0:BLE 1Mbps,1:BLE 2Mbps,2:BLE 125kbps,3:BLE 500kbps,4:IEEE 802.15.4,");
    }

    #[test]
    fn unknown_phy_is_rejected() {
        assert!(descriptor(9).is_none());
        assert!(supported(5).is_none());
    }
}
