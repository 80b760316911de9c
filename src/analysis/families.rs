//! Part family prefixes and manufacturer names
//!
//! Shared lookup tables used by correction, parsing and scoring.

/// Known part number prefixes and the manufacturer that owns the family.
/// `None` marks generic families made by many vendors.
pub const PART_FAMILIES: &[(&str, Option<&str>)] = &[
    ("ATMEGA", Some("Microchip")),
    ("ATTINY", Some("Microchip")),
    ("ATSAMD", Some("Microchip")),
    ("ATXMEGA", Some("Microchip")),
    ("AT89", Some("Microchip")),
    ("DSPIC", Some("Microchip")),
    ("PIC", Some("Microchip")),
    ("MCP", Some("Microchip")),
    ("STM32", Some("STMicroelectronics")),
    ("STM8", Some("STMicroelectronics")),
    ("L78", Some("STMicroelectronics")),
    ("L79", Some("STMicroelectronics")),
    ("ULN", Some("STMicroelectronics")),
    ("MSP430", Some("Texas Instruments")),
    ("SN74", Some("Texas Instruments")),
    ("SN75", Some("Texas Instruments")),
    ("CD4", Some("Texas Instruments")),
    ("TLV", Some("Texas Instruments")),
    ("TPS", Some("Texas Instruments")),
    ("OPA", Some("Texas Instruments")),
    ("INA", Some("Texas Instruments")),
    ("UA7", Some("Texas Instruments")),
    ("NE5", Some("Texas Instruments")),
    ("LM", Some("Texas Instruments")),
    ("TL", Some("Texas Instruments")),
    ("LTC", Some("Analog Devices")),
    ("ADM", Some("Analog Devices")),
    ("AD", Some("Analog Devices")),
    ("LT", Some("Analog Devices")),
    ("MAX", Some("Maxim Integrated")),
    ("DS18", Some("Maxim Integrated")),
    ("ESP32", Some("Espressif")),
    ("ESP8266", Some("Espressif")),
    ("CH340", Some("WCH")),
    ("FT232", Some("FTDI")),
    ("LPC", Some("NXP")),
    ("PCF", Some("NXP")),
    ("MC", Some("ON Semiconductor")),
    ("IRF", Some("Infineon")),
    ("74HCT", None),
    ("74AHC", None),
    ("74HC", None),
    ("74LS", None),
    ("2N", None),
];

/// Manufacturer names and logo text as they appear on packages
pub const MANUFACTURER_ALIASES: &[(&str, &str)] = &[
    ("TEXAS INSTRUMENTS", "Texas Instruments"),
    ("TEXAS", "Texas Instruments"),
    ("TI", "Texas Instruments"),
    ("NATIONAL SEMICONDUCTOR", "Texas Instruments"),
    ("NATIONAL", "Texas Instruments"),
    ("NS", "Texas Instruments"),
    ("STMICROELECTRONICS", "STMicroelectronics"),
    ("STMICRO", "STMicroelectronics"),
    ("STM", "STMicroelectronics"),
    ("ST", "STMicroelectronics"),
    ("MICROCHIP", "Microchip"),
    ("ATMEL", "Microchip"),
    ("NXP", "NXP"),
    ("PHILIPS", "NXP"),
    ("ON SEMICONDUCTOR", "ON Semiconductor"),
    ("ONSEMI", "ON Semiconductor"),
    ("ON", "ON Semiconductor"),
    ("FAIRCHILD", "ON Semiconductor"),
    ("MOTOROLA", "ON Semiconductor"),
    ("ANALOG DEVICES", "Analog Devices"),
    ("ADI", "Analog Devices"),
    ("LINEAR TECHNOLOGY", "Analog Devices"),
    ("LINEAR", "Analog Devices"),
    ("MAXIM", "Maxim Integrated"),
    ("INFINEON", "Infineon"),
    ("CYPRESS", "Infineon"),
    ("RENESAS", "Renesas"),
    ("ESPRESSIF", "Espressif"),
    ("WCH", "WCH"),
    ("FTDI", "FTDI"),
    ("TOSHIBA", "Toshiba"),
    ("VISHAY", "Vishay"),
    ("NORDIC", "Nordic Semiconductor"),
    ("SILICON LABS", "Silicon Labs"),
    ("SILABS", "Silicon Labs"),
];

/// Family prefix matching the start of `part`, longest first
pub fn family_of(part: &str) -> Option<(&'static str, Option<&'static str>)> {
    let part = part.to_uppercase();
    PART_FAMILIES
        .iter()
        .filter(|(prefix, _)| part.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .copied()
}

/// Manufacturer implied by a part number prefix
pub fn infer_manufacturer(part: &str) -> Option<&'static str> {
    family_of(part).and_then(|(_, manufacturer)| manufacturer)
}

/// Canonical manufacturer for free text such as `"TI"` or `"Atmel Corp"`
pub fn canonical_manufacturer(name: &str) -> Option<&'static str> {
    let padded = format!(" {} ", name.to_uppercase().split_whitespace().collect::<Vec<_>>().join(" "));
    MANUFACTURER_ALIASES
        .iter()
        .filter(|(alias, _)| padded.contains(&format!(" {} ", alias)))
        .max_by_key(|(alias, _)| alias.len())
        .map(|(_, canonical)| *canonical)
}

/// Whether two manufacturer names refer to the same company
pub fn same_manufacturer(a: &str, b: &str) -> bool {
    match (canonical_manufacturer(a), canonical_manufacturer(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.trim().eq_ignore_ascii_case(b.trim()),
    }
}
