use num::{FromPrimitive, traits::WrappingAdd};
use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};
use tracing::{debug, warn};

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    *value = value.wrapping_add(&T::from_u8(1).unwrap());
    id
}

/// Get the server listen port, either from environment or default 5075
pub fn get_default_server_port() -> u16 {
    env::var("EPICS_PVA_SERVER_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5075u16)
        .max(1024u16)
}

/// Get the list of servers to ask for channels, by reading the environment
///
/// Hostnames are resolved here, so this will re-resolve when called again
pub fn get_default_addr_list() -> Vec<SocketAddr> {
    let default_port = get_default_server_port();
    let mut ips = Vec::new();
    if let Ok(addr_list) = env::var("EPICS_PVA_ADDR_LIST") {
        for add in addr_list.split_ascii_whitespace() {
            let resolved = if add.contains(":") {
                add.to_socket_addrs()
            } else {
                (add, default_port).to_socket_addrs()
            };
            match resolved {
                Ok(addr) => {
                    debug!("Adding server address: {add} => {addr:?}");
                    ips.extend(addr);
                }
                Err(e) => {
                    warn!("Failed to convert '{add}' to address: {e}");
                    continue;
                }
            }
        }
    }
    ips
}

/// Delay before re-dialling a lost connection, default 1s
pub fn get_default_reconnect_delay() -> Duration {
    let seconds = env::var("EPICS_PVA_CONN_TMO")
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .unwrap_or(1.0f32)
        .max(0.1f32);
    Duration::from_secs_f32(seconds)
}
