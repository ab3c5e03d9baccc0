//! Serial port discovery and selection

use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use log::error;
use serialport::{available_ports, SerialPortInfo, SerialPortType, UsbPortInfo};

use super::{config::UsbDevice, Config, ConnectArgs};
use crate::error::Error;

/// USB UART adapters and badge revisions which are known to be on common
/// hardware
const KNOWN_DEVICES: &[UsbDevice] = &[
    // Silicon Labs CP210x UART Bridge
    UsbDevice {
        vid: 0x10c4,
        pid: 0xea60,
    },
    // QinHeng Electronics CH340 serial converter
    UsbDevice {
        vid: 0x1a86,
        pid: 0x7523,
    },
    // Espressif USB-JTAG-Serial peripheral
    UsbDevice {
        vid: 0x303a,
        pid: 0x1001,
    },
];

/// Resolve the serial port to use for the session.
///
/// A port named on the command line or in the configuration file is used
/// directly; otherwise the user is prompted to pick one of the detected USB
/// serial ports. Dismissing the prompt yields [Error::Cancelled], which the
/// session treats as a silent no-op rather than an error.
pub fn get_serial_port_info(
    matches: &ConnectArgs,
    config: &Config,
) -> Result<SerialPortInfo, Error> {
    let ports = detect_usb_serial_ports().unwrap_or_default();

    if let Some(serial) = &matches.port {
        find_serial_port(&ports, serial)
    } else if let Some(serial) = &config.connection.serial {
        find_serial_port(&ports, serial)
    } else {
        let (port, matches) = select_serial_port(ports, config)?;

        if let SerialPortType::UsbPort(usb_info) = &port.port_type {
            if !matches {
                let remember = Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt("Remember this serial port for future use?")
                    .interact_opt()?
                    .unwrap_or_default();

                if remember {
                    // Allow this operation to fail without terminating the
                    // application, but inform the user if something goes wrong.
                    if let Err(e) = config.save_with(|config| {
                        config.usb_device.push(UsbDevice {
                            vid: usb_info.vid,
                            pid: usb_info.pid,
                        })
                    }) {
                        error!("Failed to save config {:#}", e);
                    }
                }
            }
        }

        Ok(port)
    }
}

/// Given a list of ports, find the one whose name matches the provided
/// argument.
fn find_serial_port(ports: &[SerialPortInfo], name: &str) -> Result<SerialPortInfo, Error> {
    let port_info = ports
        .iter()
        .find(|port| port.port_name.to_lowercase() == name.to_lowercase());

    if let Some(port) = port_info {
        Ok(port.to_owned())
    } else {
        Err(Error::SerialNotFound(name.to_owned()))
    }
}

fn detect_usb_serial_ports() -> serialport::Result<Vec<SerialPortInfo>> {
    let ports = available_ports()?;
    let ports = ports
        .into_iter()
        .filter(|port_info| {
            matches!(
                &port_info.port_type,
                SerialPortType::UsbPort(..) | SerialPortType::Unknown
            )
        })
        .collect::<Vec<_>>();

    Ok(ports)
}

fn select_serial_port(
    ports: Vec<SerialPortInfo>,
    config: &Config,
) -> Result<(SerialPortInfo, bool), Error> {
    let device_matches = |info| {
        config
            .usb_device
            .iter()
            .chain(KNOWN_DEVICES.iter())
            .any(|dev| dev.matches(info))
    };

    if ports.len() > 1 {
        // Multiple serial ports detected
        println!(
            "Detected {} serial ports. Ports which match a known badge or dev board are highlighted.\n",
            ports.len()
        );

        let port_names = ports
            .iter()
            .map(|port_info| match &port_info.port_type {
                SerialPortType::UsbPort(info) => {
                    let name = if device_matches(info) {
                        format!("* {}", port_info.port_name)
                    } else {
                        format!("  {}", port_info.port_name)
                    };

                    if let Some(product) = &info.product {
                        format!("{} - {}", name, product)
                    } else {
                        name
                    }
                }
                _ => port_info.port_name.clone(),
            })
            .collect::<Vec<_>>();

        let index = Select::with_theme(&ColorfulTheme::default())
            .items(&port_names)
            .default(0)
            .interact_opt()?
            .ok_or(Error::Cancelled)?;

        match ports.get(index) {
            Some(port_info) => {
                let matches = if let SerialPortType::UsbPort(usb_info) = &port_info.port_type {
                    device_matches(usb_info)
                } else {
                    false
                };

                Ok((port_info.to_owned(), matches))
            }
            None => Err(Error::SerialNotFound(
                port_names.into_iter().nth(index).unwrap_or_default(),
            )),
        }
    } else if let [port] = ports.as_slice() {
        // Single serial port detected
        let port_name = port.port_name.clone();
        let port_info = match &port.port_type {
            SerialPortType::UsbPort(info) => info,
            _ => &UsbPortInfo {
                vid: 0,
                pid: 0,
                serial_number: None,
                manufacturer: None,
                product: None,
            },
        };

        if device_matches(port_info) {
            Ok((port.to_owned(), true))
        } else if confirm_port(&port_name, port_info)? {
            Ok((port.to_owned(), false))
        } else {
            Err(Error::Cancelled)
        }
    } else {
        // No serial ports detected
        Err(Error::NoSerial)
    }
}

fn confirm_port(port_name: &str, port_info: &UsbPortInfo) -> Result<bool, Error> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt({
            if let Some(product) = &port_info.product {
                format!("Use serial port '{}' - {}?", port_name, product)
            } else {
                format!("Use serial port '{}'?", port_name)
            }
        })
        .interact_opt()?
        .ok_or(Error::Cancelled)
}
