use anyhow::{anyhow, Context, Result};
use futures_util::stream::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::address::AddressAttribute;
use rtnetlink::{new_connection, AddressMessageBuilder, Handle, LinkUnspec, RouteMessageBuilder};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::time::{sleep, Instant};

const LINK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Thin rtnetlink wrapper covering exactly what the WireGuard data plane
/// needs: link lookup and teardown, addressing, and routes.
#[derive(Clone)]
pub struct Netlink {
    handle: Handle,
}

impl Netlink {
    pub async fn open() -> Result<Self> {
        let (connection, handle, _) = new_connection().context("netlink socket unavailable")?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    pub async fn interface_index(&self, name: &str) -> Result<Option<u32>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        Ok(links.try_next().await?.map(|link| link.header.index))
    }

    /// Polls until the named link exists; backends create the device
    /// asynchronously.
    pub async fn await_interface(&self, name: &str, timeout: Duration) -> Result<u32> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(index) = self.interface_index(name).await? {
                return Ok(index);
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("wireguard interface {} never appeared", name));
            }
            sleep(LINK_POLL_INTERVAL).await;
        }
    }

    pub async fn bring_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await?;
        Ok(())
    }

    pub async fn assign_address(&self, index: u32, address: IpAddr, prefix: u8) -> Result<()> {
        match address {
            IpAddr::V4(v4) if prefix == 32 => {
                // Delete any previous incarnation outright; a plain replace
                // keeps stale attributes alive on /32 host addresses.
                let previous = AddressMessageBuilder::<Ipv4Addr>::new()
                    .index(index)
                    .address(v4, prefix)
                    .build();
                let _ = self.handle.address().del(previous).execute().await;

                let mut request = self.handle.address().add(index, address, prefix).replace();
                // rtnetlink derives IFA_BROADCAST equal to the host address
                // on /32, and the kernel then treats unicast echo to it as
                // broadcast; strip it together with the redundant
                // address attribute.
                request.message_mut().attributes.retain(|attr| {
                    !matches!(
                        attr,
                        AddressAttribute::Broadcast(_) | AddressAttribute::Address(_)
                    )
                });
                request.execute().await?;
            }
            _ => {
                self.handle
                    .address()
                    .add(index, address, prefix)
                    .replace()
                    .execute()
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn install_route(&self, prefix: IpNet, index: u32) -> Result<()> {
        let message = match prefix {
            IpNet::V4(net) => RouteMessageBuilder::<Ipv4Addr>::new()
                .destination_prefix(net.network(), net.prefix_len())
                .output_interface(index)
                .build(),
            IpNet::V6(net) => RouteMessageBuilder::<Ipv6Addr>::new()
                .destination_prefix(net.network(), net.prefix_len())
                .output_interface(index)
                .build(),
        };
        self.handle.route().add(message).replace().execute().await?;
        Ok(())
    }

    pub async fn remove_interface(&self, name: &str) -> Result<()> {
        if let Some(index) = self.interface_index(name).await? {
            self.handle.link().del(index).execute().await?;
        }
        Ok(())
    }
}
