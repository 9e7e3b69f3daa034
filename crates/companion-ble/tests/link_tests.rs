//! End-to-end link behavior over loopback radios
//!
//! All tests run on paused time so pairing timeouts, reconnect delays and
//! scan timeouts elapse instantly.


use companion_ble::{
    Channel, ConnectionState, LinkError, LinkNotice, LoopbackAir, PairedDevice, PairingState, PairingStore,
    PeerAddress, SERVICE_UUID,
};
use serde_json::json;
use tokio::time::Duration;
use uuid::Uuid;

use test_utils::*;

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_scan_lists_only_companion_peers_by_signal() {
    let air = LoopbackAir::new();
    let _desk = advertising_node(&air, "desk", "Desk", -70).await;
    let _laptop = advertising_node(&air, "laptop", "Laptop", -40).await;
    air.add_beacon("watch", "Heart Rate", vec![Uuid::from_u128(0x180D)], -20)
        .await;
    let phone = spawn_node(&air, "phone", "Phone", -50).await;

    phone.link.start_scan().await.unwrap();
    let mut discovered = phone.link.watch_discovered();
    let peers = wait_for(&mut discovered, |peers| peers.len() == 2).await;

    let names: Vec<_> = peers.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Laptop", "Desk"]);
    assert!(peers.iter().all(|p| p.address != PeerAddress::new("watch")));
}

#[tokio::test(start_paused = true)]
async fn test_scan_stops_after_timeout() {
    let air = LoopbackAir::new();
    let phone = spawn_node(&air, "phone", "Phone", -50).await;

    phone
        .link
        .start_scan_for(Duration::from_secs(3))
        .await
        .unwrap();
    assert!(phone.link.snapshot().await.unwrap().scanning);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!phone.link.snapshot().await.unwrap().scanning);

    // A peer appearing after the scan ended is not listed
    let _desk = advertising_node(&air, "desk", "Desk", -40).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(phone.link.discovered_peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_beacon_with_companion_service_is_listed() {
    let air = LoopbackAir::new();
    air.add_beacon("tablet", "Tablet", vec![SERVICE_UUID], -60)
        .await;
    let phone = spawn_node(&air, "phone", "Phone", -50).await;

    phone.link.start_scan().await.unwrap();
    let mut discovered = phone.link.watch_discovered();
    let peers = wait_for(&mut discovered, |peers| !peers.is_empty()).await;
    assert_eq!(peers[0].name, "Tablet");
    assert_eq!(peers[0].rssi, -60);
}

#[tokio::test(start_paused = true)]
async fn test_rescan_reports_visible_peers_again() {
    let air = LoopbackAir::new();
    let _desk = advertising_node(&air, "desk", "Desk", -40).await;
    let phone = spawn_node(&air, "phone", "Phone", -50).await;

    phone.link.start_scan().await.unwrap();
    let mut discovered = phone.link.watch_discovered();
    wait_for(&mut discovered, |peers| peers.len() == 1).await;

    // Scanning again clears the list and the running scan reports desk anew
    phone.link.start_scan().await.unwrap();
    let peers = wait_for(&mut discovered, |peers| peers.len() == 1).await;
    assert_eq!(peers[0].name, "Desk");
    assert!(phone.link.snapshot().await.unwrap().scanning);
}

// ----------------------------------------------------------------------------
// Connections and Transfers
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_connected_set_tracks_both_roles() {
    let air = LoopbackAir::new();
    let desk = advertising_node(&air, "desk", "Desk", -40).await;
    let phone = spawn_node(&air, "phone", "Phone", -50).await;

    link_up(&phone, &desk).await;
    assert!(phone.link.connected_peers().contains(&desk.address));
    assert!(desk.link.connected_peers().contains(&phone.address));
    assert_eq!(phone.link.link_state(), ConnectionState::Connected);

    let info = phone
        .link
        .read_device_info(desk.address.clone())
        .await
        .unwrap();
    assert_eq!(info.name, "Desk");

    phone.link.disconnect(desk.address.clone()).await.unwrap();
    let mut phone_connected = phone.link.watch_connected();
    let mut desk_connected = desk.link.watch_connected();
    wait_for(&mut phone_connected, |set| set.is_empty()).await;
    wait_for(&mut desk_connected, |set| set.is_empty()).await;

    // Manual disconnects never reconnect
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(phone.radio.connect_attempts(), 1);
    assert_eq!(phone.link.link_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_send_to_unknown_peer_is_rejected() {
    let air = LoopbackAir::new();
    let phone = spawn_node(&air, "phone", "Phone", -50).await;
    let ghost = PeerAddress::new("ghost");

    let result = phone
        .link
        .send_data(ghost.clone(), "t1", vec![1, 2, 3])
        .await;
    assert!(matches!(result, Err(LinkError::PeerNotConnected { .. })));

    let result = phone
        .link
        .send_raw(ghost.clone(), Channel::Command, b"{}".to_vec())
        .await;
    assert!(matches!(result, Err(LinkError::PeerNotConnected { .. })));

    let result = phone.link.read_device_info(ghost).await;
    assert!(matches!(result, Err(LinkError::PeerNotConnected { .. })));

    assert_eq!(phone.link.send_command("ping", json!({})).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_chunked_transfer_both_directions() {
    let air = LoopbackAir::new();
    let desk = advertising_node(&air, "desk", "Desk", -40).await;
    let phone = spawn_node(&air, "phone", "Phone", -50).await;
    air.set_max_mtu(&desk.address, 185).await;
    link_up(&phone, &desk).await;

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

    // Client side writes
    let mut desk_notices = desk.link.notices();
    phone
        .link
        .send_data(desk.address.clone(), "photo-1", payload.clone())
        .await
        .unwrap();
    let notice = next_notice(&mut desk_notices, |n| matches!(n, LinkNotice::PayloadReceived { .. })).await;
    assert_eq!(
        notice,
        LinkNotice::PayloadReceived {
            from: phone.address.clone(),
            transfer_id: "photo-1".into(),
            payload: payload.clone(),
            complete: true,
        }
    );

    // Server side notifies
    let mut phone_notices = phone.link.notices();
    desk.link
        .send_data(phone.address.clone(), "photo-2", payload.clone())
        .await
        .unwrap();
    let notice = next_notice(&mut phone_notices, |n| matches!(n, LinkNotice::PayloadReceived { .. })).await;
    match notice {
        LinkNotice::PayloadReceived {
            from,
            transfer_id,
            payload: received,
            complete,
        } => {
            assert_eq!(from, desk.address);
            assert_eq!(transfer_id, "photo-2");
            assert_eq!(received, payload);
            assert!(complete);
        }
        other => panic!("unexpected notice {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_transfer_stops_when_link_drops() {
    let air = LoopbackAir::new();
    let desk = advertising_node(&air, "desk", "Desk", -40).await;
    let config = test_config("Phone").with_chunk_delay(Duration::from_millis(20));
    let phone = spawn_node_with(&air, "phone", config, PairingStore::in_memory(), -50).await;
    link_up(&phone, &desk).await;

    // Forty chunks twenty milliseconds apart
    let payload = vec![7u8; 20_000];
    let mut phone_notices = phone.link.notices();
    let mut desk_notices = desk.link.notices();
    let sender = phone.link.clone();
    let target = desk.address.clone();
    let transfer = tokio::spawn(async move { sender.send_data(target, "bulk", payload).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(air.sever(&phone.address, &desk.address).await);

    let result = transfer.await.unwrap();
    assert!(result.is_err());
    let notice = next_notice(&mut phone_notices, |n| matches!(n, LinkNotice::TransferFailed { .. })).await;
    assert!(matches!(
        notice,
        LinkNotice::TransferFailed { peer, transfer_id, .. } if peer == desk.address && transfer_id == "bulk"
    ));

    tokio::time::sleep(Duration::from_secs(1)).await;
    while let Ok(notice) = desk_notices.try_recv() {
        assert!(!matches!(notice, LinkNotice::PayloadReceived { .. }));
    }
}

#[tokio::test(start_paused = true)]
async fn test_commands_reach_every_connected_peer() {
    let air = LoopbackAir::new();
    let desk = advertising_node(&air, "desk", "Desk", -40).await;
    let phone = spawn_node(&air, "phone", "Phone", -50).await;
    link_up(&phone, &desk).await;

    let mut phone_notices = phone.link.notices();
    let delivered = desk
        .link
        .send_command("clipboard", json!({ "text": "hello" }))
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let notice = next_notice(&mut phone_notices, |n| matches!(n, LinkNotice::CommandReceived { .. })).await;
    assert_eq!(
        notice,
        LinkNotice::CommandReceived {
            from: desk.address.clone(),
            command: "clipboard".into(),
            params: json!({ "text": "hello" }),
        }
    );

    let mut desk_notices = desk.link.notices();
    phone
        .link
        .send_message(desk.address.clone(), "ping", json!({ "seq": 1 }))
        .await
        .unwrap();
    let notice = next_notice(&mut desk_notices, |n| matches!(n, LinkNotice::CommandReceived { .. })).await;
    assert!(matches!(notice, LinkNotice::CommandReceived { command, .. } if command == "ping"));
}

// ----------------------------------------------------------------------------
// Reconnection
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_three_attempts() {
    let air = LoopbackAir::new();
    let desk = advertising_node(&air, "desk", "Desk", -40).await;
    let phone = spawn_node(&air, "phone", "Phone", -50).await;
    link_up(&phone, &desk).await;
    assert_eq!(phone.radio.connect_attempts(), 1);

    air.set_reachable(&desk.address, false).await;
    let mut state = phone.link.watch_link_state();
    wait_for(&mut state, |s| !s.is_connected()).await;

    // Three retries five seconds apart, then nothing more
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(phone.radio.connect_attempts(), 4);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(phone.radio.connect_attempts(), 4);

    let snapshot = phone.link.snapshot().await.unwrap();
    assert!(snapshot.reconnect_attempts.is_empty());
    assert!(snapshot.connections.is_empty());
    assert_eq!(snapshot.link_state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_reports_error_state() {
    let air = LoopbackAir::new();
    let phone = spawn_node(&air, "phone", "Phone", -50).await;

    phone.link.connect(PeerAddress::new("ghost")).await.unwrap();
    let mut state = phone.link.watch_link_state();
    let failed = wait_for(&mut state, |s| matches!(s, ConnectionState::Error(_))).await;
    assert!(matches!(failed, ConnectionState::Error(reason) if reason.contains("ghost")));
    assert!(phone.link.connected_peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_retries_report_error_until_giving_up() {
    let air = LoopbackAir::new();
    let desk = advertising_node(&air, "desk", "Desk", -40).await;
    let phone = spawn_node(&air, "phone", "Phone", -50).await;
    link_up(&phone, &desk).await;

    air.set_reachable(&desk.address, false).await;
    let mut state = phone.link.watch_link_state();
    wait_for(&mut state, |s| matches!(s, ConnectionState::Error(_))).await;
    assert!(phone.radio.connect_attempts() < 4);

    wait_for(&mut state, |s| *s == ConnectionState::Disconnected).await;
    assert_eq!(phone.radio.connect_attempts(), 4);
    assert_eq!(phone.link.link_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_recovers_when_peer_returns() {
    let air = LoopbackAir::new();
    let desk = advertising_node(&air, "desk", "Desk", -40).await;
    let phone = spawn_node(&air, "phone", "Phone", -50).await;
    link_up(&phone, &desk).await;

    air.set_reachable(&desk.address, false).await;
    // First retry at 5s fails
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(phone.radio.connect_attempts(), 2);
    assert!(phone.link.connected_peers().is_empty());

    air.set_reachable(&desk.address, true).await;
    let mut connected = phone.link.watch_connected();
    wait_for(&mut connected, |set| set.contains(&desk.address)).await;
    assert_eq!(phone.radio.connect_attempts(), 3);

    // Counter was reset by the successful connection
    wait_ready(&phone, &desk.address).await;
    assert!(phone
        .link
        .snapshot()
        .await
        .unwrap()
        .reconnect_attempts
        .is_empty());
}

// ----------------------------------------------------------------------------
// Pairing
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_pairing_success_persists_on_both_sides() {
    let air = LoopbackAir::new();
    let desk = advertising_node(&air, "desk", "Desk", -40).await;
    let phone = advertising_node(&air, "phone", "Phone", -50).await;

    phone.link.start_scan().await.unwrap();
    let mut discovered = phone.link.watch_discovered();
    wait_for(&mut discovered, |peers| peers.iter().any(|p| p.address == desk.address)).await;

    let code = phone
        .link
        .initiate_pairing(desk.address.clone())
        .await
        .unwrap();
    assert_eq!(code.as_str().len(), 6);
    assert_eq!(
        phone.link.pairing_state(),
        PairingState::WaitingForConfirmation { code: code.clone() }
    );

    let mut desk_pairing = desk.link.watch_pairing();
    let state = wait_for(&mut desk_pairing, |s| matches!(s, PairingState::ConfirmationRequired { .. })).await;
    assert_eq!(state, PairingState::ConfirmationRequired { code: code.clone() });

    // A second session is refused while this one is open
    assert!(matches!(
        phone.link.initiate_pairing(desk.address.clone()).await,
        Err(LinkError::PairingInProgress)
    ));

    desk.link.accept_pairing().await.unwrap();
    let mut phone_pairing = phone.link.watch_pairing();
    wait_for(&mut phone_pairing, |s| *s == PairingState::Success).await;

    let on_desk = desk.store.load().unwrap().expect("desk persisted peer");
    assert_eq!(on_desk.address, phone.address);
    assert_eq!(on_desk.name, "Phone");

    let on_phone = phone.store.load().unwrap().expect("phone persisted peer");
    assert_eq!(on_phone.address, desk.address);
    assert_eq!(on_phone.name, "Desk");
    assert_eq!(phone.link.paired_device(), Some(on_phone));

    // Success is shown briefly, then pairing returns to Idle
    wait_for(&mut phone_pairing, |s| *s == PairingState::Idle).await;
    wait_for(&mut desk_pairing, |s| *s == PairingState::Idle).await;
    assert!(phone.link.connected_peers().contains(&desk.address));
}

#[tokio::test(start_paused = true)]
async fn test_pairing_times_out_and_tears_down_links() {
    let air = LoopbackAir::new();
    let desk = advertising_node(&air, "desk", "Desk", -40).await;
    let phone = spawn_node(&air, "phone", "Phone", -50).await;

    let code = phone
        .link
        .initiate_pairing(desk.address.clone())
        .await
        .unwrap();
    let mut desk_pairing = desk.link.watch_pairing();
    wait_for(&mut desk_pairing, |s| {
        *s == PairingState::ConfirmationRequired { code: code.clone() }
    })
    .await;

    // Nobody confirms
    let mut phone_pairing = phone.link.watch_pairing();
    let failed = wait_for(&mut phone_pairing, |s| matches!(s, PairingState::Failed { .. })).await;
    assert_eq!(
        failed,
        PairingState::Failed {
            reason: "Pairing timed out".into()
        }
    );
    wait_for(&mut desk_pairing, |s| matches!(s, PairingState::Failed { .. })).await;

    let mut phone_connected = phone.link.watch_connected();
    let mut desk_connected = desk.link.watch_connected();
    wait_for(&mut phone_connected, |set| set.is_empty()).await;
    wait_for(&mut desk_connected, |set| set.is_empty()).await;
    assert!(phone.store.load().unwrap().is_none());
    assert!(desk.store.load().unwrap().is_none());

    // Timeout teardown does not trigger reconnection
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(phone.radio.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reject_returns_to_idle() {
    let air = LoopbackAir::new();
    let desk = advertising_node(&air, "desk", "Desk", -40).await;
    let phone = spawn_node(&air, "phone", "Phone", -50).await;

    phone
        .link
        .initiate_pairing(desk.address.clone())
        .await
        .unwrap();
    let mut desk_pairing = desk.link.watch_pairing();
    wait_for(&mut desk_pairing, |s| matches!(s, PairingState::ConfirmationRequired { .. })).await;

    desk.link.reject_pairing().await.unwrap();
    assert_eq!(desk.link.pairing_state(), PairingState::Idle);
    let mut desk_connected = desk.link.watch_connected();
    wait_for(&mut desk_connected, |set| set.is_empty()).await;

    // Accepting with nothing pending is an error
    assert!(matches!(
        desk.link.accept_pairing().await,
        Err(LinkError::NoPendingPairing)
    ));

    // Rejecting or cancelling with nothing pending is not
    desk.link.reject_pairing().await.unwrap();
    phone.link.cancel_pairing().await.unwrap();
    assert_eq!(phone.link.pairing_state(), PairingState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_forget_and_auto_connect() {
    let air = LoopbackAir::new();
    let desk = advertising_node(&air, "desk", "Desk", -40).await;

    let store = PairingStore::in_memory();
    store
        .save(&PairedDevice {
            address: desk.address.clone(),
            name: "Desk".into(),
            paired_at: 1,
        })
        .unwrap();
    let phone = spawn_node_with(&air, "phone", test_config("Phone"), store, -50).await;
    assert!(phone.link.is_paired());

    assert!(phone.link.try_auto_connect().await.unwrap());
    let mut connected = phone.link.watch_connected();
    wait_for(&mut connected, |set| set.contains(&desk.address)).await;

    phone.link.forget_paired_device().await.unwrap();
    assert!(!phone.link.is_paired());
    assert!(phone.store.load().unwrap().is_none());
    assert!(!phone.link.try_auto_connect().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_auto_connect_while_scanning() {
    let air = LoopbackAir::new();
    let desk = advertising_node(&air, "desk", "Desk", -40).await;
    let store = PairingStore::in_memory();
    store
        .save(&PairedDevice {
            address: desk.address.clone(),
            name: "Desk".into(),
            paired_at: 1,
        })
        .unwrap();
    let phone = spawn_node_with(&air, "phone", test_config("Phone"), store, -50).await;

    phone.link.start_scan().await.unwrap();
    let mut discovered = phone.link.watch_discovered();
    wait_for(&mut discovered, |peers| peers.iter().any(|p| p.address == desk.address)).await;

    assert!(phone.link.try_auto_connect().await.unwrap());
    let mut connected = phone.link.watch_connected();
    wait_for(&mut connected, |set| set.contains(&desk.address)).await;
    assert_eq!(phone.radio.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_auto_connect_respects_preference_and_absence() {
    let air = LoopbackAir::new();
    let store = PairingStore::in_memory();
    store
        .save(&PairedDevice {
            address: PeerAddress::new("desk"),
            name: "Desk".into(),
            paired_at: 1,
        })
        .unwrap();
    let phone = spawn_node_with(&air, "phone", test_config("Phone"), store, -50).await;

    // Paired peer is nowhere to be found
    assert!(!phone.link.try_auto_connect().await.unwrap());
    assert!(!phone.link.snapshot().await.unwrap().scanning);

    let _desk = advertising_node(&air, "desk", "Desk", -40).await;
    phone.link.set_auto_connect(false).await.unwrap();
    assert!(!phone.link.auto_connect_enabled().unwrap());
    assert!(!phone.link.try_auto_connect().await.unwrap());
    assert_eq!(phone.radio.connect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_links() {
    let air = LoopbackAir::new();
    let desk = advertising_node(&air, "desk", "Desk", -40).await;
    let phone = spawn_node(&air, "phone", "Phone", -50).await;
    link_up(&phone, &desk).await;

    phone.link.shutdown().await.unwrap();
    assert!(!air.is_linked(&phone.address, &desk.address).await);
    assert!(matches!(
        phone.link.connect(desk.address.clone()).await,
        Err(LinkError::Shutdown)
    ));

    let mut desk_connected = desk.link.watch_connected();
    wait_for(&mut desk_connected, |set| set.is_empty()).await;
}
