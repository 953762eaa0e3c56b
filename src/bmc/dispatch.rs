//! In-session command dispatch: the curated NetFn/Cmd table.
//!
//! Handlers return a completion code and data bytes; the engine frames
//! them into the session. Hypervisor failures in the power mutations map
//! to "node busy" (0xC0) so the IPMI client retries; a failing power
//! *query* behind Get Chassis Status propagates instead, since answering
//! with a guessed state would mislead orchestration. Unknown commands
//! map to 0xC1; anything that escapes a handler is logged and answered
//! 0xFF without touching the session.

use tracing::{debug, error, info};

use vsbmc_protocol::ipmb::Request;
use vsbmc_protocol::{app_cmd, chassis_cmd, completion, netfn, transport_cmd};

use crate::vsphere::{HypervisorClient, PowerState};
use crate::Result;

use super::BmcServer;

/// Reply from a command handler, before session framing.
pub(crate) struct CommandReply {
    pub code: u8,
    pub data: Vec<u8>,
}

impl CommandReply {
    fn ok(data: Vec<u8>) -> Self {
        CommandReply {
            code: completion::OK,
            data,
        }
    }

    fn code(code: u8) -> Self {
        CommandReply {
            code,
            data: Vec::new(),
        }
    }
}

/// Fixed Get Device ID reply: IPMI 2.0, chassis device, enterprise 7154.
const DEVICE_ID: [u8; 11] = [
    0x00, // device id
    0x00, // device revision
    0x01, // firmware major
    0x00, // firmware minor
    0x02, // IPMI 2.0
    0x80, // additional support: chassis device
    0xF2, 0x1B, 0x00, // manufacturer 7154
    0x00, 0x00, // product id
];

impl<C: HypervisorClient> BmcServer<C> {
    pub(crate) fn dispatch_command(&self, request: &Request) -> CommandReply {
        info!(
            vm = %self.options.vm_name,
            "received netfn {:#04x}, command {:#04x}",
            request.netfn,
            request.cmd
        );
        match self.try_dispatch(request) {
            Ok(reply) => reply,
            Err(e) => {
                error!(vm = %self.options.vm_name, "command handler failed: {}", e);
                CommandReply::code(completion::UNSPECIFIED)
            }
        }
    }

    fn try_dispatch(&self, request: &Request) -> Result<CommandReply> {
        Ok(match (request.netfn, request.cmd) {
            (netfn::APP, app_cmd::GET_DEVICE_ID) => CommandReply::ok(DEVICE_ID.to_vec()),
            // Synthetic: auth enabled, always available, administrator.
            // Exists so vCenter's negotiation succeeds; never rejected.
            (netfn::APP, app_cmd::GET_CHANNEL_ACCESS) => {
                CommandReply::ok(vec![0b0010_0010, 0x04])
            }
            // Synthetic: channel 2, 802.3 LAN, IPMB-1.0, multi-session,
            // enterprise 7154.
            (netfn::APP, app_cmd::GET_CHANNEL_INFO) => CommandReply::ok(vec![
                0x02, 0x04, 0x01, 0x80, 0xF2, 0x1B, 0x00, 0x00, 0x00,
            ]),
            // Cold reset and the SOL payload surface are unimplemented.
            (netfn::APP, app_cmd::COLD_RESET)
            | (netfn::APP, app_cmd::ACTIVATE_PAYLOAD)
            | (netfn::APP, app_cmd::DEACTIVATE_PAYLOAD) => {
                CommandReply::code(completion::COMMAND_NOT_SUPPORTED)
            }
            (netfn::CHASSIS, chassis_cmd::GET_CHASSIS_STATUS) => self.chassis_status()?,
            (netfn::CHASSIS, chassis_cmd::CHASSIS_CONTROL) => {
                self.chassis_control(&request.data)
            }
            (netfn::CHASSIS, chassis_cmd::SET_SYSTEM_BOOT_OPTIONS) => {
                self.set_boot_options(&request.data)
            }
            (netfn::CHASSIS, chassis_cmd::GET_SYSTEM_BOOT_OPTIONS) => {
                self.get_boot_options(&request.data)
            }
            (netfn::TRANSPORT, transport_cmd::GET_LAN_CONFIGURATION_PARAMETERS) => {
                self.lan_configuration(&request.data)
            }
            _ => CommandReply::code(completion::COMMAND_NOT_SUPPORTED),
        })
    }

    /// Get Chassis Status. A power-state lie would mislead orchestration,
    /// so a failing query propagates instead of joining the 0xC0 retry
    /// path the power mutations use.
    fn chassis_status(&self) -> Result<CommandReply> {
        let state = self.client.get_power_state()?;
        let power_bit = u8::from(state == PowerState::PoweredOn);
        Ok(CommandReply::ok(vec![power_bit, 0x00, 0x00]))
    }

    /// Chassis Control: power off / on / reset / diag / soft shutdown.
    /// Every arm is guarded on the current power state, so repeating an
    /// already-satisfied request is a no-op success.
    fn chassis_control(&self, data: &[u8]) -> CommandReply {
        let Some(sub) = data.first().map(|b| b & 0x0F) else {
            return CommandReply::code(completion::INVALID_DATA_FIELD);
        };

        let result = match sub {
            0x00 => self.guarded(|state| state == PowerState::PoweredOn, C::power_off),
            0x01 => self.guarded(|state| state != PowerState::PoweredOn, C::power_on),
            0x02 => self.guarded(|state| state == PowerState::PoweredOn, C::reset),
            // Pulse diag: the hypervisor NMI path is not wired up.
            0x03 => return CommandReply::code(completion::NODE_BUSY),
            0x05 => self.guarded(|state| state == PowerState::PoweredOn, C::shutdown_guest),
            _ => return CommandReply::code(completion::INVALID_DATA_FIELD),
        };

        match result {
            Ok(()) => CommandReply::ok(Vec::new()),
            Err(e) => {
                error!(
                    vm = %self.options.vm_name,
                    "chassis control {:#04x} failed: {}", sub, e
                );
                CommandReply::code(completion::NODE_BUSY)
            }
        }
    }

    /// Run a power mutation only when `wanted` holds for the current
    /// state.
    fn guarded(
        &self,
        wanted: impl Fn(PowerState) -> bool,
        op: impl Fn(&C) -> Result<()>,
    ) -> Result<()> {
        let state = self.client.get_power_state()?;
        if wanted(state) {
            op(&self.client)?;
        } else {
            debug!(
                vm = %self.options.vm_name,
                "power state {:?} already satisfies the request", state
            );
        }
        Ok(())
    }

    /// Set System Boot Options. Boot-flag clearing acknowledgements pass
    /// through; the boot-device selection itself is a known stub that
    /// reports "node busy" (see `get_boot_options`).
    fn set_boot_options(&self, data: &[u8]) -> CommandReply {
        let Some(parameter) = data.first().map(|b| b & 0x7F) else {
            return CommandReply::code(completion::INVALID_DATA_FIELD);
        };
        match parameter {
            0 | 3 | 4 => CommandReply::ok(Vec::new()),
            5 => CommandReply::code(completion::NODE_BUSY),
            _ => CommandReply::code(completion::COMMAND_NOT_SUPPORTED),
        }
    }

    /// Get System Boot Options. Parameter 5 hits the boot-device stub;
    /// everything else is unsupported.
    fn get_boot_options(&self, data: &[u8]) -> CommandReply {
        match data.first().copied() {
            Some(5) => CommandReply::code(completion::NODE_BUSY),
            _ => CommandReply::code(completion::PARAMETER_NOT_SUPPORTED),
        }
    }

    /// Get LAN Configuration Parameters. Only the MAC address (parameter
    /// 5) is backed, with the configured fake MAC; every other selector
    /// answers "parameter not supported" with the bare revision byte.
    fn lan_configuration(&self, data: &[u8]) -> CommandReply {
        let Some(&parameter) = data.get(1) else {
            return CommandReply::code(completion::INVALID_DATA_FIELD);
        };
        info!(vm = %self.options.vm_name, "requested LAN parameter {}", parameter);

        let mut reply = vec![0x00]; // parameter revision, forced to 0
        if parameter == 5 {
            reply.extend_from_slice(&self.options.fakemac);
            CommandReply::ok(reply)
        } else {
            CommandReply {
                code: completion::PARAMETER_NOT_SUPPORTED,
                data: reply,
            }
        }
    }
}
