//! BBMD behavior: table management over the wire and broadcast
//! redistribution across a routed three-subnet topology.

use std::time::Duration;

use bytes::Bytes;

use bacnet_bip::address::Address;
use bacnet_bip::bvll::{BdtEntry, BvllFrame, FdtEntry, ResultCode};
use bacnet_bip::clock::TimeMachine;
use bacnet_bip::harness::{
    bbmd_station, bip_foreign_station, bvll_station, ClientStateMachine, PduExpect,
    StateMachineGroup,
};
use bacnet_bip::pdu::Pdu;
use bacnet_bip::runtime::{Runtime, SimRuntime};
use bacnet_bip::vlan::{VirtualIpNetwork, VirtualIpRouter};

const TIME_LIMIT: Duration = Duration::from_secs(60);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_read_bdt_returns_own_entry() {
    init_logging();
    let mut rt = Runtime::new(TimeMachine::new());
    let vlan = rt.add_network(VirtualIpNetwork::new(
        "vlan-1",
        "192.168.1.0".parse().unwrap(),
        24,
    ));
    let td = bvll_station(&mut rt, vlan, "192.168.1.2/24").unwrap();
    let _iut = bbmd_station(&mut rt, vlan, "192.168.1.3/24", &[]).unwrap();
    rt.start();

    let iut_address = Address::local_station("192.168.1.3:47808".parse().unwrap());
    let mut group = StateMachineGroup::new();
    let mut machine = ClientStateMachine::new("td", td);
    machine.call(
        Pdu::new(BvllFrame::ReadBroadcastDistributionTable).with_destination(iut_address.clone()),
        PduExpect::payload(BvllFrame::ReadBroadcastDistributionTableAck(vec![
            BdtEntry::host("192.168.1.3:47808".parse().unwrap()),
        ]))
        .from_source(iut_address),
    );
    group.append(machine);

    group.run(&mut rt, TIME_LIMIT).unwrap();
}

#[test]
fn test_write_bdt_then_read_back() {
    init_logging();
    let mut rt = Runtime::new(TimeMachine::new());
    let vlan = rt.add_network(VirtualIpNetwork::new(
        "vlan-1",
        "192.168.1.0".parse().unwrap(),
        24,
    ));
    let td = bvll_station(&mut rt, vlan, "192.168.1.2/24").unwrap();
    let _iut = bbmd_station(&mut rt, vlan, "192.168.1.3/24", &[]).unwrap();
    rt.start();

    let iut_address = Address::local_station("192.168.1.3:47808".parse().unwrap());
    let table = vec![
        BdtEntry::host("192.168.1.3:47808".parse().unwrap()),
        BdtEntry::with_prefix("192.168.2.3:47808".parse().unwrap(), 24),
    ];

    let mut group = StateMachineGroup::new();
    let mut machine = ClientStateMachine::new("td", td);
    machine.call(
        Pdu::new(BvllFrame::WriteBroadcastDistributionTable(table.clone()))
            .with_destination(iut_address.clone()),
        PduExpect::payload(BvllFrame::Result(ResultCode::Success)),
    );
    machine.call(
        Pdu::new(BvllFrame::ReadBroadcastDistributionTable).with_destination(iut_address.clone()),
        PduExpect::payload(BvllFrame::ReadBroadcastDistributionTableAck(table)),
    );
    // an invalid write NAKs and leaves the table as written above
    machine.call(
        Pdu::new(BvllFrame::WriteBroadcastDistributionTable(vec![
            BdtEntry::host("192.168.9.1:47808".parse().unwrap()),
            BdtEntry::host("192.168.9.1:47808".parse().unwrap()),
        ]))
        .with_destination(iut_address.clone()),
        PduExpect::payload(BvllFrame::Result(ResultCode::WriteBdtNak)),
    );
    machine.call(
        Pdu::new(BvllFrame::ReadBroadcastDistributionTable).with_destination(iut_address),
        PduExpect::payload(BvllFrame::ReadBroadcastDistributionTableAck(vec![
            BdtEntry::host("192.168.1.3:47808".parse().unwrap()),
            BdtEntry::with_prefix("192.168.2.3:47808".parse().unwrap(), 24),
        ])),
    );
    group.append(machine);

    group.run(&mut rt, TIME_LIMIT).unwrap();
}

/// The three-subnet topology of the redistribution scenario: BBMDs on
/// vlan 7 and 8 peered with each other, a foreign device on vlan 9
/// registered to the vlan-8 BBMD, and a router bridging all three.
fn routed_topology() -> (SimRuntime, usize, usize, usize) {
    init_logging();
    let mut rt = Runtime::new(TimeMachine::new());
    let vlan7 = rt.add_network(VirtualIpNetwork::new(
        "vlan-7",
        "192.168.7.0".parse().unwrap(),
        24,
    ));
    let vlan8 = rt.add_network(VirtualIpNetwork::new(
        "vlan-8",
        "192.168.8.0".parse().unwrap(),
        24,
    ));
    let vlan9 = rt.add_network(VirtualIpNetwork::new(
        "vlan-9",
        "192.168.9.0".parse().unwrap(),
        24,
    ));

    let mut router = VirtualIpRouter::new("router");
    router.add_port(vlan7, "192.168.7.1:47808".parse().unwrap(), 24);
    router.add_port(vlan8, "192.168.8.1:47808".parse().unwrap(), 24);
    router.add_port(vlan9, "192.168.9.1:47808".parse().unwrap(), 24);
    rt.add_router(router);

    let bbmd_7 = bbmd_station(&mut rt, vlan7, "192.168.7.3/24", &["192.168.8.3"]).unwrap();
    let bbmd_8 = bbmd_station(&mut rt, vlan8, "192.168.8.3/24", &["192.168.7.3"]).unwrap();
    let fd_9 = bip_foreign_station(&mut rt, vlan9, "192.168.9.2/24", "192.168.8.3", 30).unwrap();

    // registration happens on start and settles before anything else runs
    rt.start();
    (rt, bbmd_7, bbmd_8, fd_9)
}

#[test]
fn test_idle_network_stays_quiet() {
    let (mut rt, bbmd_7, bbmd_8, fd_9) = routed_topology();

    let mut group = StateMachineGroup::new();
    group.append(ClientStateMachine::new("bbmd-7", bbmd_7));
    group.append(ClientStateMachine::new("bbmd-8", bbmd_8));
    group.append(ClientStateMachine::new("fd-9", fd_9));

    // nothing sent, nothing received; renewals and ticks are absorbed by
    // the layers themselves
    group.run(&mut rt, TIME_LIMIT).unwrap();
}

#[test]
fn test_broadcast_redistributes_exactly_once() {
    let (mut rt, bbmd_7, bbmd_8, fd_9) = routed_topology();

    let npdu = Bytes::from(hex::decode("deadbeef").unwrap());
    let origin = Address::local_station("192.168.7.3:47808".parse().unwrap());

    let mut group = StateMachineGroup::new();

    let mut sender = ClientStateMachine::new("bbmd-7", bbmd_7);
    sender.send(Pdu::new(npdu.clone()).with_destination(Address::LocalBroadcast));
    group.append(sender);

    // each observer must see the broadcast exactly once: the expect
    // consumes one copy, strict mode fails the run on any other
    let mut peer = ClientStateMachine::new("bbmd-8", bbmd_8);
    peer.expect(
        PduExpect::payload(npdu.clone())
            .from_source(origin.clone())
            .to_destination(Address::LocalBroadcast),
    );
    group.append(peer);

    let mut foreign = ClientStateMachine::new("fd-9", fd_9);
    foreign.expect(
        PduExpect::payload(npdu)
            .from_source(origin)
            .to_destination(Address::LocalBroadcast),
    );
    group.append(foreign);

    group.run(&mut rt, TIME_LIMIT).unwrap();
}

#[test]
fn test_foreign_broadcast_reaches_remote_bbmd_upper_layer() {
    let (mut rt, bbmd_7, bbmd_8, fd_9) = routed_topology();

    let npdu = Bytes::from(hex::decode("c0ffee").unwrap());
    let fd_address = Address::local_station("192.168.9.2:47808".parse().unwrap());

    let mut group = StateMachineGroup::new();

    let mut sender = ClientStateMachine::new("fd-9", fd_9);
    sender.send(Pdu::new(npdu.clone()).with_destination(Address::LocalBroadcast));
    group.append(sender);

    // bbmd-8 hears the distribute, bbmd-7 hears it via the peering
    for (name, stack) in [("bbmd-8", bbmd_8), ("bbmd-7", bbmd_7)] {
        let mut observer = ClientStateMachine::new(name, stack);
        observer.expect(
            PduExpect::payload(npdu.clone())
                .from_source(fd_address.clone())
                .to_destination(Address::LocalBroadcast),
        );
        group.append(observer);
    }

    group.run(&mut rt, TIME_LIMIT).unwrap();
}

#[test]
fn test_read_fdt_reports_registration() {
    init_logging();
    let mut rt = Runtime::new(TimeMachine::new());
    let vlan = rt.add_network(VirtualIpNetwork::new(
        "vlan-8",
        "192.168.8.0".parse().unwrap(),
        24,
    ));
    let td = bvll_station(&mut rt, vlan, "192.168.8.7/24").unwrap();
    let _iut = bbmd_station(&mut rt, vlan, "192.168.8.3/24", &[]).unwrap();
    rt.start();

    let bbmd_address = Address::local_station("192.168.8.3:47808".parse().unwrap());
    let mut group = StateMachineGroup::new();
    let mut machine = ClientStateMachine::new("td", td);
    machine.call(
        Pdu::new(BvllFrame::RegisterForeignDevice { ttl: 30 })
            .with_destination(bbmd_address.clone()),
        PduExpect::payload(BvllFrame::Result(ResultCode::Success)),
    );
    machine.call(
        Pdu::new(BvllFrame::ReadForeignDeviceTable).with_destination(bbmd_address),
        PduExpect::payload(BvllFrame::ReadForeignDeviceTableAck(vec![FdtEntry {
            address: "192.168.8.7:47808".parse().unwrap(),
            ttl: 30,
            remaining: 60,
        }])),
    );
    group.append(machine);

    // keep within the first tick so `remaining` is still ttl + grace
    group.run(&mut rt, Duration::from_millis(500)).unwrap();
}
