use std::{fs, future::Future, io, net::Ipv4Addr, time::Duration};

use futures_util::TryStreamExt;
use tracing::{debug, warn};

use crate::{
    error::{LabError, Result},
    tuntap,
};

/// Upper bound on any single netlink round-trip; netlink is fast, this only
/// guards against a wedged kernel interface.
const HOST_OP_TIMEOUT: Duration = Duration::from_secs(15);

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Host network allocator: persistent TAP devices enslaved to bridges, plus
/// on-demand creation of the internal bridge.
pub struct HostNet {
    handle: rtnetlink::Handle,
}

impl HostNet {
    pub fn new() -> Result<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()
            .map_err(|e| LabError::resource("failed to open rtnetlink socket", e))?;
        tokio::spawn(conn);
        Ok(Self { handle })
    }

    /// Name of the lowest-index free `tap{n}{suffix}` device.
    ///
    /// Selection is not atomic with creation; the manager serializes spawns,
    /// so the index cannot be stolen by another of our own operations.
    pub fn next_tap_name(&self, suffix: &str) -> String {
        format!(
            "tap{}{}",
            lowest_free_index(list_interfaces().iter().map(String::as_str), suffix),
            suffix
        )
    }

    /// Create `name`, enslave it to `bridge`, bring the link up.
    ///
    /// If a later step fails the device is deleted again before the error
    /// surfaces, so the caller never sees a half-configured TAP.
    pub async fn create_tap(&self, name: &str, bridge: &str) -> Result<()> {
        tuntap::create_persistent_tap(name)
            .map_err(|e| LabError::resource(format!("failed to create tap {}", name), e))?;

        if let Err(e) = self.attach_and_up(name, bridge).await {
            self.release_tap(name).await;
            return Err(e);
        }

        debug!("created {} on bridge {}", name, bridge);
        Ok(())
    }

    async fn attach_and_up(&self, name: &str, bridge: &str) -> Result<()> {
        let bridge_index = self.link_index(bridge).await.ok_or_else(|| {
            LabError::resource(
                format!("bridge {} does not exist", bridge),
                io::Error::from(io::ErrorKind::NotFound),
            )
        })?;
        let tap_index = self.link_index(name).await.ok_or_else(|| {
            LabError::resource(
                format!("tap {} vanished after creation", name),
                io::Error::from(io::ErrorKind::NotFound),
            )
        })?;

        with_timeout(
            format!("failed to enslave {} to {}", name, bridge),
            self.handle.link().set(tap_index).master(bridge_index).execute(),
        )
        .await?;
        with_timeout(
            format!("failed to bring {} up", name),
            self.handle.link().set(tap_index).up().execute(),
        )
        .await?;
        Ok(())
    }

    /// Tear down a TAP. Never fails: stop paths must keep going.
    pub async fn release_tap(&self, name: &str) {
        let Some(index) = self.link_index(name).await else {
            debug!("{} already gone", name);
            return;
        };

        if let Err(e) = with_timeout(
            format!("failed to bring {} down", name),
            self.handle.link().set(index).down().execute(),
        )
        .await
        {
            warn!("{}", e);
        }
        if let Err(e) = with_timeout(
            format!("failed to delete {}", name),
            self.handle.link().del(index).execute(),
        )
        .await
        {
            warn!("{}", e);
        }
    }

    /// Create the internal bridge with its gateway address and bring it up.
    /// Safe to call every time a multi-homed instance spawns.
    pub async fn ensure_bridge(
        &self,
        name: &str,
        gateway: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<()> {
        if self.link_index(name).await.is_none() {
            with_timeout(
                format!("failed to create bridge {}", name),
                self.handle.link().add().bridge(name.to_string()).execute(),
            )
            .await?;
        }

        let index = self.link_index(name).await.ok_or_else(|| {
            LabError::resource(
                format!("bridge {} vanished after creation", name),
                io::Error::from(io::ErrorKind::NotFound),
            )
        })?;

        // EEXIST when the address is already assigned
        if let Err(e) = with_timeout(
            format!("failed to assign address to {}", name),
            self.handle
                .address()
                .add(index, gateway.into(), prefix_len)
                .execute(),
        )
        .await
        {
            debug!("bridge {} address: {}", name, e);
        }

        with_timeout(
            format!("failed to bring {} up", name),
            self.handle.link().set(index).up().execute(),
        )
        .await?;
        Ok(())
    }

    async fn link_index(&self, name: &str) -> Option<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match tokio::time::timeout(HOST_OP_TIMEOUT, links.try_next()).await {
            Ok(Ok(Some(msg))) => Some(msg.header.index),
            // no such device, or a lookup failure we treat the same way
            Ok(Ok(None)) | Ok(Err(_)) => None,
            Err(_) => {
                warn!("timed out looking up link {}", name);
                None
            }
        }
    }
}

async fn with_timeout<T, E>(
    context: String,
    fut: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    match tokio::time::timeout(HOST_OP_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(LabError::resource(context, e)),
        Err(_) => Err(LabError::resource(
            context,
            io::Error::new(io::ErrorKind::TimedOut, "host operation timed out"),
        )),
    }
}

fn list_interfaces() -> Vec<String> {
    let entries = match fs::read_dir(SYS_CLASS_NET) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .collect()
}

/// Index of a `tap{n}{suffix}` name, with nothing but digits between the
/// prefix and the suffix.
fn parse_tap_index(name: &str, suffix: &str) -> Option<u32> {
    let digits = name.strip_prefix("tap")?.strip_suffix(suffix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn lowest_free_index<'a>(names: impl Iterator<Item = &'a str>, suffix: &str) -> u32 {
    let used: Vec<u32> = names.filter_map(|n| parse_tap_index(n, suffix)).collect();
    let mut index = 0;
    while used.contains(&index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_lowest_free_index() {
        let names = ["lo", "eth0", "tap0", "tap2", "br0"];
        assert_eq!(lowest_free_index(names.into_iter(), ""), 1);
    }

    #[test]
    fn empty_host_starts_at_zero() {
        assert_eq!(lowest_free_index(["lo", "eth0"].into_iter(), ""), 0);
    }

    #[test]
    fn freed_index_is_reused() {
        // tap1 was stopped; the next allocation takes its slot back
        let names = ["tap0", "tap2"];
        assert_eq!(lowest_free_index(names.into_iter(), ""), 1);
    }

    #[test]
    fn suffixed_names_are_a_separate_namespace() {
        let names = ["tap0", "tap1", "tap0_int"];
        assert_eq!(lowest_free_index(names.iter().copied(), ""), 2);
        assert_eq!(lowest_free_index(names.iter().copied(), "_int"), 1);
    }

    #[test]
    fn ignores_non_tap_lookalikes() {
        assert_eq!(parse_tap_index("tapir", ""), None);
        assert_eq!(parse_tap_index("tap", ""), None);
        assert_eq!(parse_tap_index("tap3x", ""), None);
        assert_eq!(parse_tap_index("tap12_int", ""), None);
        assert_eq!(parse_tap_index("tap12_int", "_int"), Some(12));
        assert_eq!(parse_tap_index("tap7", ""), Some(7));
    }
}
