mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use tern_xmpp::{ConnectionEvent, ConnectionState, SessionState, StateId, XmppConnection};

use common::{FakeServer, ServerOptions, config, message, next_event, wait_until};

async fn connected(server: &FakeServer) -> XmppConnection<common::FakeConnector> {
    let mut connection = XmppConnection::new(config(), server.connector()).unwrap();
    connection.connect().await.unwrap();
    connection
}

fn ids(stanzas: &[tern_xmpp::Stanza]) -> Vec<&str> {
    stanzas.iter().filter_map(|stanza| stanza.id()).collect()
}

#[tokio::test]
async fn ack_request_confirms_everything_sent() {
    let server = FakeServer::new(ServerOptions::default());
    let connection = connected(&server).await;
    let mut events = connection.subscribe();

    for id in ["m1", "m2", "m3"] {
        connection.send_stanza(message(id)).unwrap();
    }
    assert_eq!(connection.unacked_count(), 3);
    connection.request_ack().unwrap();

    wait_until(|| connection.unacked_count() == 0).await;
    for expected in ["m1", "m2", "m3"] {
        assert_matches!(
            next_event(&mut events).await,
            ConnectionEvent::StanzaAcknowledged { id } if id == expected
        );
    }
}

#[tokio::test]
async fn acknowledgement_watcher_resolves_with_the_stanza() {
    let server = FakeServer::new(ServerOptions::default());
    let connection = connected(&server).await;

    connection.send_stanza(message("watched")).unwrap();
    let receipt = connection.watch_acknowledgement("watched").unwrap();

    let acked = tokio::time::timeout(Duration::from_secs(2), receipt)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(acked.stanza.id(), Some("watched"));
    assert!(connection.watch_acknowledgement("watched").is_err());
}

#[tokio::test]
async fn iq_requests_trigger_an_immediate_ack_request() {
    let server = FakeServer::new(ServerOptions::default());
    let connection = connected(&server).await;

    let ping = "<iq xmlns='jabber:client' type='get' id='ping1'><ping xmlns='urn:xmpp:ping'/></iq>"
        .parse()
        .unwrap();
    connection.send_stanza(ping).unwrap();

    wait_until(|| connection.unacked_count() == 0).await;
    assert!(server.sent_frame_named("r"));
}

#[tokio::test]
async fn inbound_stanzas_are_counted_and_acknowledged() {
    let server = FakeServer::new(ServerOptions::default());
    let mut connection = connected(&server).await;

    server.inject("<message xmlns='jabber:client' id='in1' from='bob@example.com/phone'><body>hi</body></message>");
    let stanza = tokio::time::timeout(Duration::from_secs(2), connection.next_stanza())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stanza.id(), Some("in1"));

    server.inject("<r xmlns='urn:xmpp:sm:3'/>");
    wait_until(|| server.client_acks() == [1]).await;
}

#[tokio::test]
async fn lost_stream_is_resumed_and_queued_stanzas_replayed() {
    let server = FakeServer::new(ServerOptions::default());
    let mut connection = connected(&server).await;
    let mut events = connection.subscribe();

    connection.send_stanza(message("m1")).unwrap();
    connection.send_stanza(message("m2")).unwrap();
    wait_until(|| server.received_ids().len() == 2).await;

    server.drop_connection();
    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::Lost { will_resume: true, .. }
    );
    assert_matches!(
        connection.stream_management_state(),
        SessionState::MayResume { .. }
    );

    connection.send_stanza(message("m3")).unwrap();
    assert_eq!(connection.unacked_count(), 3);

    connection
        .recover_after_network_interruption("network changed".to_string())
        .await
        .unwrap();

    assert!(connection.walk_path().contains(&StateId::StreamResumption));
    assert!(!connection.walk_path().contains(&StateId::ResourceBinding));
    assert_matches!(next_event(&mut events).await, ConnectionEvent::Resumed { replayed: 1 });
    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::Established { resumed: true, .. }
    );
    assert_eq!(connection.bound_jid(), Some("alice@example.com/tests"));

    wait_until(|| connection.unacked_count() == 0).await;
    assert_eq!(server.received_ids(), ["m1", "m2", "m3"]);
    assert_eq!(connection.stream_management_state(), SessionState::Active);
}

#[tokio::test]
async fn rejected_resumption_reports_undelivered_and_binds_again() {
    let server = FakeServer::new(ServerOptions::default());
    let mut connection = connected(&server).await;
    let mut events = connection.subscribe();

    connection.send_stanza(message("m1")).unwrap();
    connection.send_stanza(message("m2")).unwrap();
    wait_until(|| server.received_ids().len() == 2).await;

    server.drop_connection();
    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::Lost { will_resume: true, .. }
    );
    connection.send_stanza(message("m3")).unwrap();
    server.set_options(|options| options.accept_resume = false);

    connection
        .recover_after_network_interruption("network changed".to_string())
        .await
        .unwrap();

    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::StanzasNotDelivered { stanzas } if ids(&stanzas) == ["m3"]
    );
    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::Established { resumed: false, .. }
    );

    let path = connection.walk_path();
    assert!(path.contains(&StateId::ResourceBinding));
    assert!(path.contains(&StateId::StreamManagementEnable));
    assert_eq!(connection.stream_management_state(), SessionState::Active);
    assert_eq!(connection.unacked_count(), 0);
    assert_eq!(server.received_ids(), ["m1", "m2"]);
}

#[tokio::test]
async fn without_resumption_a_lost_stream_reports_undelivered() {
    let server = FakeServer::new(ServerOptions::default());
    let mut connection =
        XmppConnection::new(config().with_resumption(false), server.connector()).unwrap();
    connection.connect().await.unwrap();
    assert_eq!(connection.stream_id(), None);
    let mut events = connection.subscribe();

    connection.send_stanza(message("m1")).unwrap();
    wait_until(|| server.received_ids().len() == 1).await;
    server.drop_connection();

    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::Lost { will_resume: false, .. }
    );
    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::StanzasNotDelivered { stanzas } if ids(&stanzas) == ["m1"]
    );
    assert_eq!(connection.stream_management_state(), SessionState::Terminated);

    connection
        .recover_after_network_interruption("retry".to_string())
        .await
        .unwrap();
    assert!(connection.walk_path().contains(&StateId::ResourceBinding));
    assert!(!connection.walk_path().contains(&StateId::StreamResumption));
}

#[tokio::test(start_paused = true)]
async fn expired_resumption_window_falls_back_to_binding() {
    let server = FakeServer::new(ServerOptions::default());
    let mut connection = connected(&server).await;
    let mut events = connection.subscribe();

    connection.send_stanza(message("late")).unwrap();
    server.drop_connection();
    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::Lost { will_resume: true, .. }
    );

    tokio::time::advance(Duration::from_secs(301)).await;
    connection
        .recover_after_network_interruption("back online".to_string())
        .await
        .unwrap();

    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::StanzasNotDelivered { stanzas } if ids(&stanzas) == ["late"]
    );
    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::Established { resumed: false, .. }
    );
    assert!(!server.sent_frame_named("resume"));
}

#[tokio::test(start_paused = true)]
async fn window_closing_during_the_walk_falls_back_to_binding() {
    let server = FakeServer::new(ServerOptions::default());
    let mut settings = config();
    settings.modules.stream_management.preferred_resumption_seconds = Some(40);
    let mut connection = XmppConnection::new(settings, server.connector()).unwrap();
    connection.connect().await.unwrap();
    let mut events = connection.subscribe();

    connection.send_stanza(message("late")).unwrap();
    server.drop_connection();
    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::Lost { will_resume: true, .. }
    );

    // Three stream openings of 20s each: the window is still open when the
    // walk starts and closed by the time resumption is considered.
    server.set_options(|options| options.features_delay = Duration::from_secs(20));
    connection
        .recover_after_network_interruption("back online".to_string())
        .await
        .unwrap();

    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::StanzasNotDelivered { stanzas } if ids(&stanzas) == ["late"]
    );
    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::Established { resumed: false, .. }
    );
    let path = connection.walk_path();
    assert!(path.contains(&StateId::ResourceBinding));
    assert!(path.contains(&StateId::StreamManagementEnable));
    assert!(!server.sent_frame_named("resume"));
    assert_eq!(connection.stream_management_state(), SessionState::Active);
    assert_eq!(connection.unacked_count(), 0);
}

#[tokio::test]
async fn stanzas_sent_while_recovering_are_delivered_once_in_order() {
    let server = FakeServer::new(ServerOptions::default());
    let mut connection = connected(&server).await;
    let expected: Vec<String> = (1..=20).map(|n| format!("s{n}")).collect();

    let sender = connection.sender();
    let outgoing = expected.clone();
    let sending = tokio::spawn(async move {
        for id in outgoing {
            sender.send(message(&id)).unwrap();
            tokio::task::yield_now().await;
        }
    });
    connection
        .recover_after_network_interruption("network changed".to_string())
        .await
        .unwrap();
    sending.await.unwrap();

    assert!(connection.walk_path().contains(&StateId::StreamResumption));
    wait_until(|| server.received_ids().len() == expected.len()).await;
    assert_eq!(server.received_ids(), expected);

    connection.request_ack().unwrap();
    wait_until(|| connection.unacked_count() == 0).await;
    assert_eq!(connection.stream_management_state(), SessionState::Active);
}

#[tokio::test]
async fn removed_acknowledgement_watcher_is_dropped() {
    let server = FakeServer::new(ServerOptions::default());
    let connection = connected(&server).await;

    connection.send_stanza(message("quiet")).unwrap();
    let receipt = connection.watch_acknowledgement("quiet").unwrap();
    assert!(connection.unwatch_acknowledgement("quiet"));

    assert!(
        tokio::time::timeout(Duration::from_secs(2), receipt)
            .await
            .unwrap()
            .is_err()
    );
    wait_until(|| connection.unacked_count() == 0).await;
    assert!(!connection.unwatch_acknowledgement("quiet"));
}

#[tokio::test]
async fn acknowledging_unsent_stanzas_drops_the_stream() {
    let server = FakeServer::new(ServerOptions::default());
    let connection = connected(&server).await;
    let mut events = connection.subscribe();

    connection.send_stanza(message("m1")).unwrap();
    server.inject("<a xmlns='urn:xmpp:sm:3' h='5'/>");

    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::Lost { will_resume: true, .. }
    );
}

#[tokio::test]
async fn graceful_disconnect_closes_stream_and_reports_pending() {
    let server = FakeServer::new(ServerOptions::default());
    let mut connection = connected(&server).await;
    let mut events = connection.subscribe();

    connection.send_stanza(message("pending")).unwrap();
    connection.disconnect().await.unwrap();

    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::StanzasNotDelivered { stanzas } if ids(&stanzas) == ["pending"]
    );
    assert_matches!(
        next_event(&mut events).await,
        ConnectionEvent::Disconnected { .. }
    );
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(connection.stream_management_state(), SessionState::Inactive);
    assert_eq!(server.frames().last().map(String::as_str), Some("</stream:stream>"));
}

#[tokio::test]
async fn instant_shutdown_keeps_the_session_resumable() {
    let server = FakeServer::new(ServerOptions::default());
    let mut connection = connected(&server).await;

    connection.send_stanza(message("held")).unwrap();
    connection.instant_shutdown().await;

    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_matches!(
        connection.stream_management_state(),
        SessionState::MayResume { .. }
    );
    assert_eq!(connection.unacked_count(), 1);

    connection.connect().await.unwrap();
    assert!(connection.walk_path().contains(&StateId::StreamResumption));
    wait_until(|| connection.unacked_count() == 0).await;
}
