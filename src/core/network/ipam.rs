use std::{
    collections::{BTreeMap, HashMap},
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use bitvec::prelude::*;
use ipnet::Ipv4Net;
use log::debug;

use super::persist::{self, StateLock};
use crate::core::error::{RTError, Result};

/// Largest subnet the allocator tracks, a /8.
const MAX_HOST_BITS: u8 = 24;

pub type Bitmap = BitVec<u8, Msb0>;

/// Parses a CIDR string such as `192.168.1.0/24`.
pub fn parse_subnet(cidr: &str) -> Result<Ipv4Net> {
    cidr.trim()
        .parse::<Ipv4Net>()
        .map_err(|e| RTError::invalid_subnet(cidr, e))
}

/// In-memory form of the IPAM state file: one bitmap per subnet, keyed by
/// the subnet's CIDR string. Bit `n` stands for `network + n + 1`.
#[derive(Debug, Default, PartialEq)]
pub struct SubnetBitmaps {
    subnets: HashMap<String, Bitmap>,
}

impl SubnetBitmaps {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let Some(contents) = persist::read_if_exists(path.as_ref())? else {
            return Ok(Self::default());
        };

        let raw: BTreeMap<String, String> = serde_json::from_slice(&contents)?;
        let mut subnets = HashMap::with_capacity(raw.len());
        for (cidr, bits) in raw {
            let subnet = parse_subnet(&cidr)?;
            let bitmap = decode_bitmap(&cidr, &bits)?;

            if bitmap.len() != bitmap_len(&subnet)? {
                return Err(RTError::storage_error(
                    &format!("bitmap for {cidr} has length {}", bitmap.len()),
                    None,
                ));
            }
            subnets.insert(cidr, bitmap);
        }

        Ok(Self { subnets })
    }

    pub fn dump(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw: BTreeMap<&str, String> = self
            .subnets
            .iter()
            .map(|(cidr, bitmap)| (cidr.as_str(), encode_bitmap(bitmap)))
            .collect();

        persist::write_atomic(path.as_ref(), &serde_json::to_vec(&raw)?)
    }

    pub fn bitmap(&self, subnet: &Ipv4Net) -> Option<&BitSlice<u8, Msb0>> {
        self.subnets
            .get(&subnet.trunc().to_string())
            .map(|b| b.as_bitslice())
    }

    pub fn allocate(&mut self, subnet: &Ipv4Net) -> Result<Ipv4Addr> {
        let subnet = subnet.trunc();
        let len = bitmap_len(&subnet)?;
        let key = subnet.to_string();

        let bitmap = self
            .subnets
            .entry(key.clone())
            .or_insert_with(|| bitvec![u8, Msb0; 0; len]);

        let pos = bitmap
            .first_zero()
            .ok_or_else(|| RTError::SubnetExhausted(key.clone()))?;
        let ip = calculate_ip(&subnet, pos).ok_or(RTError::SubnetExhausted(key))?;
        bitmap.set(pos, true);

        Ok(ip)
    }

    pub fn release(&mut self, subnet: &Ipv4Net, ip: Ipv4Addr) -> Result<()> {
        let subnet = subnet.trunc();
        let key = subnet.to_string();

        let pos = ip_to_index(&subnet, ip).ok_or_else(|| RTError::OutOfRange {
            subnet: key.clone(),
            ip,
        })?;

        let bitmap = self
            .subnets
            .get_mut(&key)
            .ok_or_else(|| RTError::NotAllocated {
                subnet: key.clone(),
                ip,
            })?;

        if pos >= bitmap.len() {
            return Err(RTError::OutOfRange { subnet: key, ip });
        }
        if !bitmap[pos] {
            return Err(RTError::NotAllocated { subnet: key, ip });
        }
        bitmap.set(pos, false);

        Ok(())
    }
}

/// File-backed address allocator. Each call loads the state file, mutates
/// it and writes it back under an exclusive lock.
#[derive(Debug, Clone)]
pub struct IpAllocator {
    path: PathBuf,
}

impl IpAllocator {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn allocate(&self, subnet: &Ipv4Net) -> Result<Ipv4Addr> {
        let _lock = StateLock::acquire(&self.path)?;

        let mut bitmaps = SubnetBitmaps::load(&self.path)?;
        let ip = bitmaps.allocate(subnet)?;
        bitmaps.dump(&self.path)?;

        debug!("[IPAM] allocated {} from {}", ip, subnet.trunc());
        Ok(ip)
    }

    pub fn release(&self, subnet: &Ipv4Net, ip: Ipv4Addr) -> Result<()> {
        let _lock = StateLock::acquire(&self.path)?;

        let mut bitmaps = SubnetBitmaps::load(&self.path)?;
        bitmaps.release(subnet, ip)?;
        bitmaps.dump(&self.path)?;

        debug!("[IPAM] released {} to {}", ip, subnet.trunc());
        Ok(())
    }
}

fn bitmap_len(subnet: &Ipv4Net) -> Result<usize> {
    let host_bits = subnet.max_prefix_len() - subnet.prefix_len();
    if host_bits > MAX_HOST_BITS {
        return Err(RTError::invalid_subnet(
            &subnet.to_string(),
            format!("prefix shorter than /{}", 32 - MAX_HOST_BITS),
        ));
    }

    Ok(1 << host_bits)
}

fn calculate_ip(subnet: &Ipv4Net, index: usize) -> Option<Ipv4Addr> {
    let base = u32::from(subnet.network());
    let offset = u32::try_from(index).ok()?.checked_add(1)?;

    base.checked_add(offset).map(Ipv4Addr::from)
}

fn ip_to_index(subnet: &Ipv4Net, ip: Ipv4Addr) -> Option<usize> {
    let base = u32::from(subnet.network());

    u32::from(ip)
        .checked_sub(1)?
        .checked_sub(base)
        .map(|pos| pos as usize)
}

fn encode_bitmap(bitmap: &Bitmap) -> String {
    bitmap.iter().map(|b| if *b { '1' } else { '0' }).collect()
}

fn decode_bitmap(cidr: &str, bits: &str) -> Result<Bitmap> {
    bits.chars()
        .map(|c| match c {
            '0' => Ok(false),
            '1' => Ok(true),
            other => Err(RTError::storage_error(
                &format!("invalid character {other:?} in bitmap for {cidr}"),
                None,
            )),
        })
        .collect()
}
