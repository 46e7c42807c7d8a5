//! Data file header (community standard for skyglow observations 1.0).

use crate::config::DaemonConfig;
use crate::protocol::{Identification, Readouts};
use crate::reading::LocalTime;

#[cfg(test)]
pub const HEADER_LINES: usize = 35;

const TEMPLATE: &str = "\
# Definition of the community standard for skyglow observations 1.0
# URL: http://www.darksky.org/NSBM/sdf1.0.pdf
# Number of header lines: 35
# This data is released under the following license: ODbL 1.0 http://opendatacommons.org/licenses/odbl/summary/
# Device type: $DEVICE_TYPE
# Instrument ID: $DEVICE_ID
# Data supplier: $DATA_SUPPLIER
# Location name: $LOCATION_NAME
# Position: $OBSLAT, $OBSLON, $OBSALT
# Local timezone: $TIMEZONE
# Time Synchronization: NTP
# Moving / Stationary position: STATIONARY
# Moving / Fixed look direction: FIXED
# Number of channels: 1
# Filters per channel: HOYA CM-500
# Measurement direction per channel: 0., 0.
# Field of view: 20
# Number of fields per line: 6
# SQM serial number: $SERIAL_NUMBER
# SQM firmware version: $FEATURE_NUMBER
# SQM cover offset value: $OFFSET
# SQM readout test ix: $IXREADOUT
# SQM readout test rx: $RXREADOUT
# SQM readout test cx: $CXREADOUT
# Comment:
# Comment:
# Comment:
# Comment:
# Comment: Capture program: sqm-host
# blank line 30
# blank line 31
# blank line 32
# UTC Date & Time, Local Date & Time, Temperature, Counts, Frequency, MSAS
# YYYY-MM-DDTHH:mm:ss.fff;YYYY-MM-DDTHH:mm:ss.fff;Celsius;number;Hz;mag/arcsec^2
# END OF HEADER
";

fn single_line(text: &str) -> String {
    text.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

/// Fill the template for the connected device.
pub fn render(
    config: &DaemonConfig,
    local_time: &LocalTime,
    identification: &Identification,
    readouts: &Readouts,
) -> String {
    let replacements = [
        ("$DEVICE_TYPE", config.device.kind.model_name().to_string()),
        ("$DEVICE_ID", config.instrument_id()),
        ("$DATA_SUPPLIER", config.device.data_supplier.clone()),
        ("$LOCATION_NAME", config.device.location_name.clone()),
        ("$OBSLAT", config.site.latitude.to_string()),
        ("$OBSLON", config.site.longitude.to_string()),
        ("$OBSALT", config.site.altitude.to_string()),
        ("$TIMEZONE", local_time.label()),
        ("$SERIAL_NUMBER", identification.serial.to_string()),
        ("$FEATURE_NUMBER", identification.feature.to_string()),
        ("$OFFSET", config.device.offset_calibration.to_string()),
        ("$IXREADOUT", single_line(&readouts.identify)),
        ("$RXREADOUT", single_line(&readouts.data)),
        ("$CXREADOUT", single_line(&readouts.calibration)),
    ];

    replacements
        .iter()
        .fold(TEMPLATE.to_string(), |text, (key, value)| text.replace(key, value))
}
