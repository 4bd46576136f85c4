use crate::presence::DeviceId;

/// Common consumer OUIs, used when the scan tool doesn't name a vendor.
/// Not exhaustive; an unknown prefix simply leaves the vendor unset.
const OUI_VENDORS: &[([u8; 3], &str)] = &[
    ([0x00, 0x03, 0x93], "Apple"),
    ([0x00, 0x1C, 0xB3], "Apple"),
    ([0x3C, 0x22, 0xFB], "Apple"),
    ([0xA4, 0x83, 0xE7], "Apple"),
    ([0xF0, 0x18, 0x98], "Apple"),
    ([0x00, 0x12, 0xFB], "Samsung"),
    ([0x5C, 0x0A, 0x5B], "Samsung"),
    ([0x8C, 0x77, 0x12], "Samsung"),
    ([0x3C, 0x5A, 0xB4], "Google"),
    ([0xF4, 0xF5, 0xD8], "Google"),
    ([0x44, 0x07, 0x0B], "Google"),
    ([0xB8, 0x27, 0xEB], "Raspberry Pi Foundation"),
    ([0xDC, 0xA6, 0x32], "Raspberry Pi Trading"),
    ([0xE4, 0x5F, 0x01], "Raspberry Pi Trading"),
    ([0x24, 0x0A, 0xC4], "Espressif"),
    ([0x30, 0xAE, 0xA4], "Espressif"),
    ([0x50, 0xC7, 0xBF], "TP-Link"),
    ([0xF4, 0xEC, 0x38], "TP-Link"),
    ([0x00, 0x17, 0x88], "Philips Lighting"),
    ([0x68, 0x54, 0xFD], "Amazon"),
    ([0xFC, 0x65, 0xDE], "Amazon"),
    ([0x00, 0x50, 0x56], "VMware"),
    ([0x08, 0x00, 0x27], "Oracle VirtualBox"),
    ([0x28, 0x6C, 0x07], "Xiaomi"),
    ([0x00, 0x1A, 0x11], "Google"),
    ([0x00, 0x0C, 0x29], "VMware"),
];

/// Look up the vendor for a hardware address by its OUI prefix.
pub fn lookup(id: &DeviceId) -> Option<&'static str> {
    let oui = id.oui();
    OUI_VENDORS
        .iter()
        .find(|(prefix, _)| *prefix == oui)
        .map(|&(_, vendor)| vendor)
}
