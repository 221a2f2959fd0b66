//! Unit tests for the harness connection state machine.

use liftlink::sensors::link::{
    DiscoveredCharacteristic, DiscoveredService, Link, LinkAction, LinkEvent, LinkFault, LinkState,
};
use liftlink::sensors::protocol::{HARNESS_NOTIFY_UUID, HARNESS_SERVICE_UUID, HARNESS_WRITE_UUID};
use liftlink::sensors::ConnectionStatus;
use uuid::Uuid;

fn harness_service(with_write: bool) -> DiscoveredService {
    let mut characteristics = vec![DiscoveredCharacteristic {
        uuid: HARNESS_NOTIFY_UUID,
        can_notify: true,
        can_write: false,
    }];
    if with_write {
        characteristics.push(DiscoveredCharacteristic {
            uuid: HARNESS_WRITE_UUID,
            can_notify: false,
            can_write: true,
        });
    }
    DiscoveredService {
        uuid: HARNESS_SERVICE_UUID,
        characteristics,
    }
}

/// Drive a link from Disconnected to Ready.
fn ready_link() -> Link {
    let mut link = Link::new("AA:BB", Some(517));
    link.handle(LinkEvent::ConnectRequested);
    link.handle(LinkEvent::Connected);
    link.handle(LinkEvent::MtuNegotiated { mtu: Some(247) });
    link.handle(LinkEvent::ServicesDiscovered(vec![harness_service(true)]));
    link.handle(LinkEvent::DescriptorWritten { success: true });
    link
}

#[test]
fn test_full_handshake_actions() {
    let mut link = Link::new("AA:BB", Some(517));

    assert_eq!(link.handle(LinkEvent::ConnectRequested), vec![LinkAction::Connect]);
    assert_eq!(link.connection_status(), ConnectionStatus::Connecting);

    assert_eq!(link.handle(LinkEvent::Connected), vec![LinkAction::RequestMtu(517)]);
    assert_eq!(link.connection_status(), ConnectionStatus::Connected);

    assert_eq!(
        link.handle(LinkEvent::MtuNegotiated { mtu: Some(247) }),
        vec![LinkAction::DiscoverServices]
    );
    assert_eq!(link.mtu(), 247);

    assert_eq!(
        link.handle(LinkEvent::ServicesDiscovered(vec![harness_service(true)])),
        vec![LinkAction::EnableNotifications {
            characteristic: HARNESS_NOTIFY_UUID
        }]
    );
    assert_eq!(link.state(), LinkState::ServiceDiscovery);

    assert!(link.handle(LinkEvent::DescriptorWritten { success: true }).is_empty());
    assert!(link.is_ready());
    assert!(link.can_send_commands());
}

#[test]
fn test_unknown_mtu_keeps_default() {
    let mut link = Link::new("AA:BB", Some(517));
    link.handle(LinkEvent::ConnectRequested);
    link.handle(LinkEvent::Connected);
    link.handle(LinkEvent::MtuNegotiated { mtu: None });
    assert_eq!(link.mtu(), 23);
}

#[test]
fn test_wrong_service_is_fatal_but_stays_connected() {
    let mut link = Link::new("AA:BB", None);
    link.handle(LinkEvent::ConnectRequested);
    link.handle(LinkEvent::Connected);

    let other = DiscoveredService {
        uuid: Uuid::from_u128(0x180d),
        characteristics: Vec::new(),
    };
    assert_eq!(
        link.handle(LinkEvent::ServicesDiscovered(vec![other])),
        vec![LinkAction::ReportFault(LinkFault::ServiceMissing)]
    );
    assert_eq!(link.connection_status(), ConnectionStatus::Connected);
    assert_eq!(link.fault(), Some(LinkFault::ServiceMissing));
    assert!(!link.can_send_commands());
}

#[test]
fn test_missing_write_disables_commands_only() {
    let mut link = Link::new("AA:BB", None);
    link.handle(LinkEvent::ConnectRequested);
    link.handle(LinkEvent::Connected);

    let actions = link.handle(LinkEvent::ServicesDiscovered(vec![harness_service(false)]));
    assert!(actions.contains(&LinkAction::ReportFault(LinkFault::WriteMissing)));
    assert!(actions.contains(&LinkAction::EnableNotifications {
        characteristic: HARNESS_NOTIFY_UUID
    }));

    link.handle(LinkEvent::DescriptorWritten { success: true });
    assert!(link.is_ready());
    assert!(!link.can_send_commands());
}

#[test]
fn test_transport_errors_release_the_link() {
    let mut link = ready_link();
    assert_eq!(
        link.handle(LinkEvent::GattError {
            reason: "status 133".to_string()
        }),
        vec![LinkAction::Release]
    );
    assert_eq!(link.connection_status(), ConnectionStatus::Disconnected);

    // Late completions after teardown are ignored
    assert!(link.handle(LinkEvent::Disconnected).is_empty());
    assert!(link.handle(LinkEvent::DescriptorWritten { success: false }).is_empty());
}

#[test]
fn test_local_disconnect_closes_then_releases() {
    let mut link = ready_link();
    assert_eq!(
        link.handle(LinkEvent::DisconnectRequested),
        vec![LinkAction::Disconnect, LinkAction::Release]
    );
    assert!(!link.can_send_commands());
}

#[test]
fn test_reconnect_after_release_starts_clean() {
    let mut link = ready_link();
    link.handle(LinkEvent::Disconnected);

    assert_eq!(link.handle(LinkEvent::ConnectRequested), vec![LinkAction::Connect]);
    assert!(link.notify_characteristic().is_none());
    assert!(link.fault().is_none());
}
