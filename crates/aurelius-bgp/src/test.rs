mod base {
    use crate::{
        rfc4271::{
            ASPathSegment,
            BGPMessageHeader,
            NotificationMessage,
            OpenMessage,
            Origin,
            PathAttribute,
            UpdateMessage,
        },
        BGPElement,
        BGPMessage,
        HEADER_LEN,
        MARKER,
    };
    use aurelius_common::Prefix;
    use core::str::FromStr;
    use std::{
        net::IpAddr,
        vec,
        vec::Vec,
    };

    #[test]
    fn test_keepalive_wire_format() {
        let buffer = BGPMessage::KeepAlive.pack();
        assert_eq!(buffer.len(), HEADER_LEN as usize);
        assert_eq!(&buffer[..16], &MARKER);
        assert_eq!(&buffer[16..18], &[0x00, 0x13]);
        assert_eq!(buffer[18], BGPMessage::KEEPALIVE);
        assert_eq!(BGPMessage::unpack(&buffer).unwrap().1, BGPMessage::KeepAlive);
    }

    #[test]
    fn test_open_message() {
        let message = BGPMessage::Open(OpenMessage {
            version: 4,
            autonomous_system: 65001,
            hold_time: 180,
            bgp_identifier: u32::from(core::net::Ipv4Addr::new(10, 0, 0, 1)),
            optional_parameters: Vec::new(),
        });

        let buffer = message.pack();
        assert_eq!(buffer.len(), 29);
        assert_eq!(buffer[18], BGPMessage::OPEN);
        assert_eq!(BGPMessage::unpack(&buffer).unwrap().1, message);
    }

    #[test]
    fn test_notification_message() {
        let message = BGPMessage::Notification(NotificationMessage::new(6, 3, "peer de-configured"));
        let buffer = message.pack();
        assert_eq!(&buffer[19..21], &[6, 3]);

        let BGPMessage::Notification(notification) = BGPMessage::unpack(&buffer).unwrap().1 else {
            panic!("Message is not a notification message");
        };
        assert_eq!(notification.diagnostic(), "peer de-configured");
    }

    #[test]
    fn test_update_message() {
        let message = BGPMessage::Update(UpdateMessage {
            withdrawn_routes: vec![Prefix::from_str("172.16.0.0/16").unwrap()],
            path_attributes: vec![
                PathAttribute::Origin(Origin::IGP),
                PathAttribute::AsPath(vec![ASPathSegment::Sequence(vec![65001, 65002])]),
                PathAttribute::NextHop(IpAddr::from_str("192.168.2.200").unwrap()),
            ],
            nlri: vec![Prefix::from_str("192.168.100.0/24").unwrap()],
        });

        let unpacked = BGPMessage::unpack(&message.pack()).unwrap().1;
        assert_eq!(unpacked, message);

        let BGPMessage::Update(update) = unpacked else {
            panic!("Message is not an update message");
        };
        assert_eq!(update.route_count(), 2);
        assert!(!update.is_end_of_rib());
    }

    #[test]
    fn test_unpack_many() {
        let mut buffer = BGPMessage::KeepAlive.pack();
        buffer.extend(BGPMessage::Notification(NotificationMessage::new(4, 0, "hold timer expired")).pack());

        let messages = BGPMessage::unpack_many(&buffer).unwrap().1;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], BGPMessage::KeepAlive);
        assert_eq!(messages[1].kind(), BGPMessage::NOTIFICATION);
    }

    #[test]
    fn test_header_round_trip() {
        let header = BGPMessageHeader {
            marker: MARKER,
            length: 42,
            kind: BGPMessage::UPDATE,
        };
        assert_eq!(BGPMessageHeader::unpack(&header.pack()).unwrap().1, header);
    }
}

mod multiprotocol_extensions {
    use crate::{
        prefix::Family,
        rfc3392::Capability,
        rfc4271::{
            OpenMessage,
            OptionalParameter,
            UpdateMessage,
        },
        rfc4760::MultiprotocolExtensionsCapability,
        BGPElement,
        BGPMessage,
    };
    use std::vec;

    #[test]
    fn test_open_message_with_capabilities() {
        let message = BGPMessage::Open(OpenMessage {
            version: 4,
            autonomous_system: 65001,
            hold_time: 90,
            bgp_identifier: 0x0A000001,
            optional_parameters: vec![OptionalParameter::Capabilities(vec![
                Capability::MultiprotocolExtensions(MultiprotocolExtensionsCapability {
                    family: Family::IPV4_UNICAST,
                }),
                Capability::MultiprotocolExtensions(MultiprotocolExtensionsCapability {
                    family: Family::IPV6_UNICAST,
                }),
            ])],
        });

        let BGPMessage::Open(open) = BGPMessage::unpack(&message.pack()).unwrap().1 else {
            panic!("Message is not an open message");
        };

        let capabilities = open.capabilities();
        assert_eq!(
            capabilities[0],
            &Capability::MultiprotocolExtensions(MultiprotocolExtensionsCapability {
                family: Family::IPV4_UNICAST,
            })
        );
        assert_eq!(
            capabilities[1],
            &Capability::MultiprotocolExtensions(MultiprotocolExtensionsCapability {
                family: Family::IPV6_UNICAST,
            })
        );
    }

    #[test]
    fn test_end_of_rib_ipv4() {
        let marker = UpdateMessage::end_of_rib(Family::IPV4_UNICAST);
        assert!(marker.is_end_of_rib());

        // An IPv4 unicast End-of-RIB is the smallest possible update, 23 bytes on the wire.
        let buffer = BGPMessage::Update(marker).pack();
        assert_eq!(buffer.len(), 23);
    }

    #[test]
    fn test_end_of_rib_ipv6() {
        let marker = UpdateMessage::end_of_rib(Family::IPV6_UNICAST);
        assert!(marker.is_end_of_rib());
        assert_eq!(marker.route_count(), 0);

        let unpacked = BGPMessage::unpack(&BGPMessage::Update(marker.clone()).pack()).unwrap().1;
        assert_eq!(unpacked, BGPMessage::Update(marker));
    }

    #[test]
    fn test_empty_update_is_end_of_rib() {
        assert!(UpdateMessage::empty().is_end_of_rib());
        assert_eq!(UpdateMessage::empty().route_count(), 0);
    }
}

mod graceful_restart {
    use crate::{
        prefix::Family,
        rfc3392::{
            Capability,
            CAPABILITY_GRACEFUL_RESTART,
            CAPABILITY_MULTIPROTOCOL,
        },
        rfc4271::{
            OpenMessage,
            OptionalParameter,
        },
        rfc4724::{
            GracefulRestartCapability,
            RestartFamily,
            FORWARDING_STATE,
        },
        BGPElement,
    };
    use std::vec;

    #[test]
    fn test_capability_round_trip() {
        let capability = Capability::GracefulRestart(GracefulRestartCapability {
            restart_state: true,
            restart_time: 120,
            families: vec![RestartFamily {
                family: Family::IPV4_UNICAST,
                flags: FORWARDING_STATE,
            }],
        });

        assert_eq!(Capability::unpack(&capability.pack()).unwrap().1, capability);
    }

    #[test]
    fn test_announced_lookup() {
        let open = OpenMessage {
            version: 4,
            autonomous_system: 65001,
            hold_time: 180,
            bgp_identifier: 1,
            optional_parameters: vec![OptionalParameter::Capabilities(vec![Capability::GracefulRestart(
                GracefulRestartCapability {
                    restart_state: false,
                    restart_time: 120,
                    families: vec![],
                },
            )])],
        };

        assert!(open.announced(CAPABILITY_GRACEFUL_RESTART));
        assert!(!open.announced(CAPABILITY_MULTIPROTOCOL));
    }
}
