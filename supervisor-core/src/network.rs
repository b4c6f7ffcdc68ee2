//! Network namespace construction and transparent traffic interposition.
//!
//! Runs post-fork in the child only. The app gets a private network
//! namespace with a working loopback, plus (when the `ip_tables` kernel
//! module is available) a dummy interface that swallows the default route
//! and a NAT table that rewrites every non-loopback TCP/UDP destination to
//! 127.0.0.1:23136. The app believes it has a network; everything it sends
//! actually lands on a host-provided proxy port.

use crate::structy::StructyMessage;
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use std::fs;
use std::mem;
use std::os::raw::{c_char, c_int, c_void};
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

/// All redirected traffic is delivered here.
pub const PROXY_PORT: u16 = 23136;

const LOOPBACK_ADDR: u32 = 0x7f00_0001; // 127.0.0.1
const DUMMY_ADDR: u32 = 0xc0a8_fa02; // 192.168.250.2
const GATEWAY_ADDR: u32 = 0xc0a8_fa01; // 192.168.250.1; anything in 192.168.250.x works

// rtnetlink attribute types not exported by libc.
const IFLA_IFNAME: u16 = 3;
const IFLA_LINKINFO: u16 = 18;
const IFLA_INFO_KIND: u16 = 1;

// Netfilter socket options (IPT_BASE_CTL = 64; get and set spaces are
// numbered independently).
const IPT_SO_SET_REPLACE: c_int = 64;
const IPT_SO_GET_INFO: c_int = 64;

const NF_ACCEPT: i32 = 1;

const NF_INET_PRE_ROUTING: usize = 0;
const NF_INET_LOCAL_IN: usize = 1;
const NF_INET_FORWARD: usize = 2;
const NF_INET_LOCAL_OUT: usize = 3;
const NF_INET_POST_ROUTING: usize = 4;
const NF_INET_NUMHOOKS: usize = 5;

const NF_NAT_RANGE_MAP_IPS: u32 = 1 << 0;
const NF_NAT_RANGE_PROTO_SPECIFIED: u32 = 1 << 1;

const XT_TABLE_MAXNAMELEN: usize = 32;
const XT_EXTENSION_MAXNAMELEN: usize = 29;
const XT_FUNCTION_MAXNAMELEN: usize = 30;

#[repr(C)]
struct RtAttr {
    rta_len: u16,
    rta_type: u16,
}

#[repr(C)]
struct IptGetinfo {
    name: [u8; XT_TABLE_MAXNAMELEN],
    valid_hooks: u32,
    hook_entry: [u32; NF_INET_NUMHOOKS],
    underflow: [u32; NF_INET_NUMHOOKS],
    num_entries: u32,
    size: u32,
}

#[repr(C)]
struct IptReplace {
    name: [u8; XT_TABLE_MAXNAMELEN],
    valid_hooks: u32,
    num_entries: u32,
    size: u32,
    hook_entry: [u32; NF_INET_NUMHOOKS],
    underflow: [u32; NF_INET_NUMHOOKS],
    num_counters: u32,
    counters: *mut XtCounters,
    // struct ipt_entry entries[0] follows.
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct XtCounters {
    pcnt: u64,
    bcnt: u64,
}

#[repr(C)]
struct IptIp {
    src: u32,
    dst: u32,
    smsk: u32,
    dmsk: u32,
    iniface: [u8; 16],
    outiface: [u8; 16],
    iniface_mask: [u8; 16],
    outiface_mask: [u8; 16],
    proto: u16,
    flags: u8,
    invflags: u8,
}

#[repr(C)]
struct IptEntry {
    ip: IptIp,
    nfcache: u32,
    target_offset: u16,
    next_offset: u16,
    comefrom: u32,
    counters: XtCounters,
    // Target data follows.
}

#[repr(C)]
struct XtEntryTarget {
    target_size: u16,
    name: [u8; XT_EXTENSION_MAXNAMELEN],
    revision: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct NfNatIpv4Range {
    flags: u32,
    min_ip: u32,
    max_ip: u32,
    min_port: u16,
    max_port: u16,
}

#[repr(C)]
struct NfNatIpv4MultiRangeCompat {
    rangesize: u32,
    range: [NfNatIpv4Range; 1],
}

#[repr(C)]
struct XtErrorTarget {
    target: XtEntryTarget,
    errorname: [u8; XT_FUNCTION_MAXNAMELEN],
}

/// Detects whether the iptables kernel module is loaded. Must run before
/// entering the sandbox: it needs the host's /proc.
pub fn is_ip_tables_loaded() -> Result<bool> {
    let modules = fs::read_to_string("/proc/modules").context("failed to read /proc/modules")?;
    Ok(modules.lines().any(|line| line.starts_with("ip_tables ")))
}

fn checked(rc: c_int, what: &'static str) -> Result<c_int> {
    Errno::result(rc).context(what)
}

fn ifreq_for(name: &str) -> libc::ifreq {
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as c_char;
    }
    ifr
}

fn set_interface_addr(fd: RawFd, name: &str, addr: u32) -> Result<()> {
    let mut ifr = ifreq_for(name);
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr { s_addr: addr.to_be() },
        sin_zero: [0; 8],
    };
    unsafe {
        std::ptr::write(
            &mut ifr.ifr_ifru.ifru_addr as *mut libc::sockaddr as *mut libc::sockaddr_in,
            sin,
        );
    }
    checked(
        unsafe { libc::ioctl(fd, libc::SIOCSIFADDR, &ifr) },
        "ioctl(SIOCSIFADDR) failed",
    )?;
    Ok(())
}

fn set_interface_flags(fd: RawFd, name: &str, flags: i16) -> Result<()> {
    let mut ifr = ifreq_for(name);
    unsafe {
        ifr.ifr_ifru.ifru_flags = flags;
    }
    checked(
        unsafe { libc::ioctl(fd, libc::SIOCSIFFLAGS, &ifr) },
        "ioctl(SIOCSIFFLAGS) failed",
    )?;
    Ok(())
}

/// Builds the RTM_NEWLINK request that creates `dummy0`.
///
/// IFLA_LINKINFO nests an IFLA_INFO_KIND attribute whose string value is
/// not NUL-terminated, unlike IFLA_IFNAME.
fn build_dummy_link_message() -> StructyMessage {
    let mut msg = StructyMessage::with_alignment(4);

    let header = msg.add::<libc::nlmsghdr>();
    {
        let h = msg.at_mut::<libc::nlmsghdr>(header);
        h.nlmsg_type = libc::RTM_NEWLINK;
        h.nlmsg_flags =
            (libc::NLM_F_REQUEST | libc::NLM_F_ACK | libc::NLM_F_CREATE | libc::NLM_F_EXCL) as u16;
    }

    msg.add::<libc::ifinfomsg>(); // left zeroed

    let ifname = msg.add::<RtAttr>();
    {
        let a = msg.at_mut::<RtAttr>(ifname);
        a.rta_len = (mem::size_of::<RtAttr>() + "dummy0".len() + 1) as u16;
        a.rta_type = IFLA_IFNAME;
    }
    msg.add_str("dummy0");

    let linkinfo = msg.add::<RtAttr>();
    msg.at_mut::<RtAttr>(linkinfo).rta_type = IFLA_LINKINFO;

    let kind = msg.add::<RtAttr>();
    {
        let a = msg.at_mut::<RtAttr>(kind);
        a.rta_type = IFLA_INFO_KIND;
        a.rta_len = (mem::size_of::<RtAttr>() + "dummy".len()) as u16;
    }
    msg.add_bytes(b"dummy");

    let end = msg.end();
    msg.at_mut::<RtAttr>(linkinfo).rta_len = (end - linkinfo) as u16;
    msg.at_mut::<libc::nlmsghdr>(header).nlmsg_len = (end - header) as u32;

    msg
}

/// Creates the `dummy0` interface over rtnetlink and checks the ack.
fn create_dummy_interface() -> Result<()> {
    let raw = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_ROUTE) };
    let netlink = unsafe { OwnedFd::from_raw_fd(checked(raw, "socket(AF_NETLINK) failed")?) };
    let nl_fd: RawFd = {
        use std::os::unix::io::AsRawFd;
        netlink.as_raw_fd()
    };

    let sndbuf: c_int = 32768;
    checked(
        unsafe {
            libc::setsockopt(
                nl_fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &sndbuf as *const c_int as *const c_void,
                mem::size_of::<c_int>() as libc::socklen_t,
            )
        },
        "setsockopt(SO_SNDBUF) failed",
    )?;
    let rcvbuf: c_int = 1_048_576;
    checked(
        unsafe {
            libc::setsockopt(
                nl_fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &rcvbuf as *const c_int as *const c_void,
                mem::size_of::<c_int>() as libc::socklen_t,
            )
        },
        "setsockopt(SO_RCVBUF) failed",
    )?;

    let msg = build_dummy_link_message();

    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

    let sent = unsafe {
        libc::sendto(
            nl_fd,
            msg.as_ptr() as *const c_void,
            msg.len(),
            0,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(Errno::last()).context("sendto(netlink) failed");
    }

    let mut reply = [0u64; 128]; // u64 backing keeps the headers aligned
    let received = unsafe {
        libc::recv(
            nl_fd,
            reply.as_mut_ptr() as *mut c_void,
            mem::size_of_val(&reply),
            0,
        )
    };
    if received < 0 {
        return Err(Errno::last()).context("recv(netlink) failed");
    }
    if (received as usize) < mem::size_of::<libc::nlmsghdr>() + mem::size_of::<c_int>() {
        bail!("truncated netlink ack");
    }

    let header = unsafe { &*(reply.as_ptr() as *const libc::nlmsghdr) };
    if header.nlmsg_type != libc::NLMSG_ERROR as u16 || header.nlmsg_seq != 0 {
        bail!(
            "unexpected netlink reply (type {}, seq {})",
            header.nlmsg_type,
            header.nlmsg_seq
        );
    }
    let error = unsafe {
        *(reply
            .as_ptr()
            .cast::<u8>()
            .add(mem::size_of::<libc::nlmsghdr>()) as *const c_int)
    };
    if error != 0 {
        return Err(Errno::from_raw(-error)).context("netlink(ip link add dummy0 type dummy) failed");
    }
    Ok(())
}

/// Adds the default route via the dummy gateway, so that all non-loopback
/// traffic is steered onto `dummy0` where the NAT table can grab it.
fn add_default_route(fd: RawFd) -> Result<()> {
    let mut route: libc::rtentry = unsafe { mem::zeroed() };
    route.rt_flags = (libc::RTF_UP | libc::RTF_GATEWAY) as u16;
    route.rt_dst.sa_family = libc::AF_INET as libc::sa_family_t;
    let gateway = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: GATEWAY_ADDR.to_be(),
        },
        sin_zero: [0; 8],
    };
    unsafe {
        std::ptr::write(
            &mut route.rt_gateway as *mut libc::sockaddr as *mut libc::sockaddr_in,
            gateway,
        );
    }
    checked(
        unsafe { libc::ioctl(fd, libc::SIOCADDRT, &route) },
        "ioctl(SIOCADDRT) failed",
    )?;
    Ok(())
}

fn copy_name(dst: &mut [u8], name: &str) {
    dst[..name.len()].copy_from_slice(name.as_bytes());
}

/// Appends one standard-verdict entry (an ipt_entry whose target is the
/// builtin verdict target) and returns the entry's offset.
fn add_standard_entry(msg: &mut StructyMessage, verdict: i32) -> usize {
    let entry = msg.add::<IptEntry>();
    let target = msg.add::<XtEntryTarget>();
    let v = msg.add::<i32>();
    *msg.at_mut::<i32>(v) = verdict;
    let end = msg.end();
    msg.at_mut::<XtEntryTarget>(target).target_size = (end - target) as u16;
    let e = msg.at_mut::<IptEntry>(entry);
    e.target_offset = (target - entry) as u16;
    e.next_offset = (end - entry) as u16;
    entry
}

/// Appends one DNAT entry for `proto`, rewriting every destination to
/// 127.0.0.1:PROXY_PORT, and returns the entry's offset.
fn add_dnat_entry(msg: &mut StructyMessage, proto: u16) -> usize {
    let entry = msg.add::<IptEntry>();
    msg.at_mut::<IptEntry>(entry).ip.proto = proto;
    let target = msg.add::<XtEntryTarget>();
    let range = msg.add::<NfNatIpv4MultiRangeCompat>();
    {
        let r = msg.at_mut::<NfNatIpv4MultiRangeCompat>(range);
        r.rangesize = 1;
        r.range[0].flags = NF_NAT_RANGE_PROTO_SPECIFIED | NF_NAT_RANGE_MAP_IPS;
        r.range[0].min_ip = LOOPBACK_ADDR.to_be();
        r.range[0].max_ip = LOOPBACK_ADDR.to_be();
        r.range[0].min_port = PROXY_PORT.to_be();
        r.range[0].max_port = PROXY_PORT.to_be();
    }
    let end = msg.end();
    {
        let t = msg.at_mut::<XtEntryTarget>(target);
        t.target_size = (end - target) as u16;
        copy_name(&mut t.name, "DNAT");
    }
    let e = msg.at_mut::<IptEntry>(entry);
    e.target_offset = (target - entry) as u16;
    e.next_offset = (end - entry) as u16;
    entry
}

/// Builds the full `nat` table replacement blob.
///
/// Entry order: [accept 127.0.0.0/8] [DNAT tcp] [DNAT udp] [accept all]
/// [ERROR sentinel]. LOCAL_OUT starts at the accept-local entry; every
/// other hook starts (and underflows) at accept-all.
fn build_nat_replace(info: &IptGetinfo, counters: *mut XtCounters) -> StructyMessage {
    let mut msg = StructyMessage::new();

    let replace = msg.add::<IptReplace>();
    {
        let r = msg.at_mut::<IptReplace>(replace);
        copy_name(&mut r.name, "nat");
        r.valid_hooks = info.valid_hooks;
        // The kernel insists on somewhere to write out the old table's
        // counters, even though they are of no interest.
        r.num_counters = info.num_entries;
        r.counters = counters;
    }
    let entries_base = msg.end();

    let accept_local = add_standard_entry(&mut msg, -1 - NF_ACCEPT);
    {
        let e = msg.at_mut::<IptEntry>(accept_local);
        e.ip.dst = 0x7f00_0000u32.to_be(); // 127.0.0.0
        e.ip.dmsk = 0xff00_0000u32.to_be(); // 255.0.0.0
    }

    let _dnat_tcp = add_dnat_entry(&mut msg, libc::IPPROTO_TCP as u16);
    let _dnat_udp = add_dnat_entry(&mut msg, libc::IPPROTO_UDP as u16);
    let accept_all = add_standard_entry(&mut msg, -1 - NF_ACCEPT);

    // The customary terminal ERROR entry.
    let error_entry = msg.add::<IptEntry>();
    let error_target = msg.add::<XtErrorTarget>();
    let end = msg.end();
    {
        let t = msg.at_mut::<XtErrorTarget>(error_target);
        t.target.target_size = (end - error_target) as u16;
        copy_name(&mut t.target.name, "ERROR");
        copy_name(&mut t.errorname, "ERROR");
    }
    {
        let e = msg.at_mut::<IptEntry>(error_entry);
        e.target_offset = (error_target - error_entry) as u16;
        e.next_offset = (end - error_entry) as u16;
    }

    {
        let accept_local_off = (accept_local - entries_base) as u32;
        let accept_all_off = (accept_all - entries_base) as u32;
        let r = msg.at_mut::<IptReplace>(replace);
        r.num_entries = 5;
        r.size = (end - entries_base) as u32;

        r.hook_entry[NF_INET_PRE_ROUTING] = accept_all_off;
        r.hook_entry[NF_INET_LOCAL_IN] = accept_all_off;
        r.hook_entry[NF_INET_FORWARD] = accept_all_off;
        r.hook_entry[NF_INET_LOCAL_OUT] = accept_local_off;
        r.hook_entry[NF_INET_POST_ROUTING] = accept_all_off;

        r.underflow[NF_INET_PRE_ROUTING] = accept_all_off;
        r.underflow[NF_INET_LOCAL_IN] = accept_all_off;
        r.underflow[NF_INET_FORWARD] = accept_all_off;
        r.underflow[NF_INET_LOCAL_OUT] = accept_local_off;
        r.underflow[NF_INET_POST_ROUTING] = accept_all_off;
    }

    msg
}

/// Installs the NAT redirect table. Equivalent-ish to:
///   iptables -t nat -A OUTPUT -p tcp -j DNAT --to 127.0.0.1:23136
///   iptables -t nat -A OUTPUT -p udp -j DNAT --to 127.0.0.1:23136
fn install_nat_redirect(fd: RawFd) -> Result<()> {
    // The update request must carry bookkeeping from the current table.
    let mut info: IptGetinfo = unsafe { mem::zeroed() };
    copy_name(&mut info.name, "nat");
    let mut optlen = mem::size_of::<IptGetinfo>() as libc::socklen_t;
    checked(
        unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_IP,
                IPT_SO_GET_INFO,
                &mut info as *mut IptGetinfo as *mut c_void,
                &mut optlen,
            )
        },
        "getsockopt(IPT_SO_GET_INFO) failed",
    )?;

    let mut old_counters = vec![XtCounters::default(); info.num_entries as usize];
    let msg = build_nat_replace(&info, old_counters.as_mut_ptr());

    checked(
        unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                IPT_SO_SET_REPLACE,
                msg.as_ptr() as *const c_void,
                msg.len() as libc::socklen_t,
            )
        },
        "setsockopt(IPT_SO_SET_REPLACE) failed",
    )?;
    Ok(())
}

/// Unshares the network namespace and configures it from scratch.
pub fn unshare_network(have_ip_tables: bool) -> Result<()> {
    unshare(CloneFlags::CLONE_NEWNET).context("unshare(CLONE_NEWNET) failed")?;

    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_IP) };
    let sock = unsafe { OwnedFd::from_raw_fd(checked(raw, "socket(AF_INET) failed")?) };
    let fd: RawFd = {
        use std::os::unix::io::AsRawFd;
        sock.as_raw_fd()
    };

    set_interface_addr(fd, "lo", LOOPBACK_ADDR)?;
    set_interface_flags(
        fd,
        "lo",
        (libc::IFF_LOOPBACK | libc::IFF_UP | libc::IFF_RUNNING) as i16,
    )?;

    if !have_ip_tables {
        tracing::warn!(
            "ip_tables kernel module not loaded; cannot set up transparent network forwarding"
        );
        return Ok(());
    }

    // The dummy interface exists only so packets can be routed at it and
    // then picked off by the NAT table.
    create_dummy_interface()?;
    set_interface_addr(fd, "dummy0", DUMMY_ADDR)?;
    set_interface_flags(fd, "dummy0", (libc::IFF_UP | libc::IFF_RUNNING) as i16)?;
    add_default_route(fd)?;
    install_nat_redirect(fd)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netlink_message_layout() {
        let msg = build_dummy_link_message();

        let header = msg.at::<libc::nlmsghdr>(0);
        assert_eq!(header.nlmsg_type, libc::RTM_NEWLINK);
        assert_eq!(header.nlmsg_len as usize, msg.len());
        assert_eq!(
            header.nlmsg_flags,
            (libc::NLM_F_REQUEST | libc::NLM_F_ACK | libc::NLM_F_CREATE | libc::NLM_F_EXCL) as u16
        );

        // ifinfomsg directly follows the header.
        let attrs_start = mem::size_of::<libc::nlmsghdr>() + mem::size_of::<libc::ifinfomsg>();
        let ifname = msg.at::<RtAttr>(attrs_start);
        assert_eq!(ifname.rta_type, IFLA_IFNAME);
        assert_eq!(ifname.rta_len as usize, mem::size_of::<RtAttr>() + 7);
        let name_off = attrs_start + mem::size_of::<RtAttr>();
        assert_eq!(&msg.as_slice()[name_off..name_off + 7], b"dummy0\0");

        // IFLA_LINKINFO wraps the IFLA_INFO_KIND attribute; the kind string
        // is not NUL-terminated.
        let linkinfo_off = name_off + 8;
        let linkinfo = msg.at::<RtAttr>(linkinfo_off);
        assert_eq!(linkinfo.rta_type, IFLA_LINKINFO);
        assert_eq!(linkinfo_off + linkinfo.rta_len as usize, msg.len());
        let kind_off = linkinfo_off + mem::size_of::<RtAttr>();
        let kind = msg.at::<RtAttr>(kind_off);
        assert_eq!(kind.rta_type, IFLA_INFO_KIND);
        assert_eq!(kind.rta_len as usize, mem::size_of::<RtAttr>() + 5);
        let kind_str = kind_off + mem::size_of::<RtAttr>();
        assert_eq!(&msg.as_slice()[kind_str..kind_str + 5], b"dummy");
    }

    #[test]
    fn nat_table_layout() {
        let mut info: IptGetinfo = unsafe { mem::zeroed() };
        info.valid_hooks = 0b11011;
        info.num_entries = 4;
        let msg = build_nat_replace(&info, std::ptr::null_mut());

        let replace = msg.at::<IptReplace>(0);
        assert_eq!(&replace.name[..4], b"nat\0");
        assert_eq!(replace.valid_hooks, 0b11011);
        assert_eq!(replace.num_entries, 5);
        assert_eq!(replace.num_counters, 4);

        let entries_base = mem::size_of::<IptReplace>();
        assert_eq!(replace.size as usize, msg.len() - entries_base);

        // Walk the entry chain via next_offset and collect offsets relative
        // to the entries block.
        let mut offsets = Vec::new();
        let mut pos = entries_base;
        while pos < msg.len() {
            offsets.push((pos - entries_base) as u32);
            let entry = msg.at::<IptEntry>(pos);
            assert_eq!(entry.target_offset as usize, mem::size_of::<IptEntry>());
            pos += entry.next_offset as usize;
        }
        assert_eq!(pos, msg.len());
        assert_eq!(offsets.len(), 5);

        // LOCAL_OUT enters at the accept-local entry; every other hook at
        // accept-all (the fourth entry).
        let accept_local = offsets[0];
        let accept_all = offsets[3];
        assert_eq!(replace.hook_entry[NF_INET_LOCAL_OUT], accept_local);
        assert_eq!(replace.underflow[NF_INET_LOCAL_OUT], accept_local);
        for hook in [
            NF_INET_PRE_ROUTING,
            NF_INET_LOCAL_IN,
            NF_INET_FORWARD,
            NF_INET_POST_ROUTING,
        ] {
            assert_eq!(replace.hook_entry[hook], accept_all);
            assert_eq!(replace.underflow[hook], accept_all);
        }

        // The accept-local entry matches only 127.0.0.0/8.
        let first = msg.at::<IptEntry>(entries_base);
        assert_eq!(first.ip.dst, 0x7f00_0000u32.to_be());
        assert_eq!(first.ip.dmsk, 0xff00_0000u32.to_be());

        // The DNAT entries redirect tcp and udp to the proxy port.
        for (idx, proto) in [(1usize, libc::IPPROTO_TCP as u16), (2, libc::IPPROTO_UDP as u16)] {
            let entry_off = entries_base + offsets[idx] as usize;
            let entry = msg.at::<IptEntry>(entry_off);
            assert_eq!(entry.ip.proto, proto);
            let target_off = entry_off + entry.target_offset as usize;
            let target = msg.at::<XtEntryTarget>(target_off);
            assert_eq!(&target.name[..5], b"DNAT\0");
            let range_off = target_off + mem::size_of::<XtEntryTarget>();
            let range = msg.at::<NfNatIpv4MultiRangeCompat>(range_off);
            assert_eq!(range.rangesize, 1);
            assert_eq!(range.range[0].min_ip, LOOPBACK_ADDR.to_be());
            assert_eq!(range.range[0].min_port, PROXY_PORT.to_be());
            assert_eq!(range.range[0].max_port, PROXY_PORT.to_be());
        }

        // The chain is capped with the ERROR sentinel.
        let error_off = entries_base + offsets[4] as usize;
        let error_entry = msg.at::<IptEntry>(error_off);
        let error_target =
            msg.at::<XtErrorTarget>(error_off + error_entry.target_offset as usize);
        assert_eq!(&error_target.target.name[..6], b"ERROR\0");
        assert_eq!(&error_target.errorname[..6], b"ERROR\0");
    }

    #[test]
    fn struct_sizes_match_kernel_abi() {
        assert_eq!(mem::size_of::<IptIp>(), 84);
        assert_eq!(mem::size_of::<IptEntry>(), 112);
        assert_eq!(mem::size_of::<XtEntryTarget>(), 32);
        assert_eq!(mem::size_of::<NfNatIpv4MultiRangeCompat>(), 24);
        assert_eq!(mem::size_of::<IptGetinfo>(), 84);
        assert_eq!(mem::size_of::<IptReplace>(), 96);
    }
}
