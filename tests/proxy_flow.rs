// End-to-end transaction flows through the controller with mock ports
mod common;

#[cfg(test)]
mod test {
    use std::{net::IpAddr, sync::Arc, time::Duration};

    use trunkline::{
        config::models::{ErrorMappingConfig, MappingRuleConfig, ProxyConfig, TargetConfig},
        core::{
            app_config::{ProxyAppConfig, ResponseInterest},
            destination::Transport,
            error::ProxyError,
            message::{Request, Response, SipUri},
            normalization::{Normalization, NoopNormalization},
            transaction::{TransactionId, TransactionState},
        },
        ports::dns::SrvRecord,
    };

    use crate::common::{CountingLookup, Harness, ScriptedTransport, TestHandler, app, invite, static_trunk};

    fn config_with_trunk(destinations: &[(&str, f32)]) -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.trunks.insert("pstn".to_string(), static_trunk(destinations));
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failover_to_lower_preference() {
        let config = config_with_trunk(&[("sip:10.0.0.1", 0.5), ("sip:10.0.0.2", 1.0)]);
        let transport = ScriptedTransport::new(&[("10.0.0.2:5060", 503), ("10.0.0.1:5060", 200)]);
        let mut harness = Harness::new(&config, transport, CountingLookup::default());
        let handler = TestHandler::new(Some("pstn"));

        let handle = harness
            .controller
            .on_request(TransactionId::from("tx-failover"), invite("sip:+15551234@example.com"), &app(handler, ResponseInterest::none()))
            .await;

        let (id, response) = harness.next_response().await;
        assert_eq!(id.as_str(), "tx-failover");
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("X-Served-By"), Some("10.0.0.1:5060"));
        assert_eq!(harness.transport.sent_to(), vec!["10.0.0.2:5060", "10.0.0.1:5060"]);
        assert_eq!(handle.wait_terminal().await, TransactionState::Completed);
        assert_eq!(handle.attempts(), 2);
        assert_eq!(harness.upstream.responses().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_every_candidate_failing_is_attempted_once() {
        let config = config_with_trunk(&[("sip:10.0.0.1", 1.0), ("sip:10.0.0.2", 0.7), ("sip:10.0.0.3", 0.3)]);
        let transport = ScriptedTransport::new(&[("10.0.0.1:5060", 500), ("10.0.0.2:5060", 502)]);
        let mut harness = Harness::new(&config, transport, CountingLookup::default());

        let handle = harness
            .controller
            .on_request(
                TransactionId::generate(),
                invite("sip:+15551234@example.com"),
                &app(TestHandler::new(Some("pstn")), ResponseInterest::none()),
            )
            .await;

        let (_, response) = harness.next_response().await;
        assert_eq!(handle.wait_terminal().await, TransactionState::Failed);
        assert_eq!(handle.attempts(), 3);
        assert_eq!(harness.transport.sent_to().len(), 3);
        // Last received status was 502 from the second destination
        assert_eq!(response.status, 502);
        assert_eq!(response.headers.get("Call-ID"), Some("a84b4c76e66710@pc33.example.com"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_goes_through_error_mapping() {
        let mut config = config_with_trunk(&[("sip:10.0.0.1", 1.0)]);
        config.error_mappings.push(ErrorMappingConfig {
            name: "carrier".to_string(),
            rules: vec![MappingRuleConfig {
                codes: vec![500, 503],
                code: 480,
                phrase: "Carrier Unavailable".to_string(),
            }],
        });
        config.default_error_mapping = Some("carrier".to_string());
        let transport = ScriptedTransport::new(&[("10.0.0.1:5060", 500)]);
        let mut harness = Harness::new(&config, transport, CountingLookup::default());

        harness
            .controller
            .on_request(
                TransactionId::generate(),
                invite("sip:+15551234@example.com"),
                &app(TestHandler::new(Some("pstn")), ResponseInterest::none()),
            )
            .await;

        let (_, response) = harness.next_response().await;
        assert_eq!(response.status, 480);
        assert_eq!(response.reason, "Carrier Unavailable");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_interest_filters_notification_not_forwarding() {
        let config = config_with_trunk(&[("sip:10.0.0.1", 1.0)]);
        let transport = ScriptedTransport::new(&[("10.0.0.1:5060", 200)]);
        let mut harness = Harness::new(&config, transport, CountingLookup::default());
        let handler = TestHandler::new(Some("pstn"));
        let only_6xx = ResponseInterest::new([false, false, false, false, false, true]);

        harness
            .controller
            .on_request(TransactionId::generate(), invite("sip:+15551234@example.com"), &app(handler.clone(), only_6xx))
            .await;

        let (_, response) = harness.next_response().await;
        assert_eq!(response.status, 200);
        assert_eq!(response.reason, "OK");
        assert_eq!(response.headers.get("X-Served-By"), Some("10.0.0.1:5060"));
        assert!(handler.notified().is_empty());

        let interested = TestHandler::new(Some("pstn"));
        harness
            .controller
            .on_request(TransactionId::generate(), invite("sip:+15551234@example.com"), &app(interested.clone(), ResponseInterest::all()))
            .await;
        harness.next_response().await;
        assert_eq!(interested.notified(), vec![200]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mid_dialog_bypasses_routing() {
        let mut config = ProxyConfig::default();
        let mut trunk = static_trunk(&[]);
        trunk.target = TargetConfig::Resolve {
            name: "carrier.example.com".to_string(),
            transport: None,
            port: None,
        };
        config.trunks.insert("carrier".to_string(), trunk);
        let transport = ScriptedTransport::new(&[("192.0.2.10:5060", 200)]);
        let mut harness = Harness::new(&config, transport, CountingLookup::default());
        let handler = TestHandler::new(Some("carrier"));

        let bye = Request::new("BYE", SipUri::parse("sip:bob@198.51.100.7").unwrap())
            .with_header("To", "<sip:bob@example.com>;tag=8321234356")
            .with_header("Route", "<sip:192.0.2.10;lr>")
            .with_header("Call-ID", "dialog-1");

        let handle = harness
            .controller
            .on_request(TransactionId::generate(), bye, &app(handler.clone(), ResponseInterest::all()))
            .await;

        let (_, response) = harness.next_response().await;
        assert_eq!(response.status, 200);
        assert_eq!(handle.wait_terminal().await, TransactionState::Completed);
        assert_eq!(harness.transport.sent_to(), vec!["192.0.2.10:5060"]);
        assert_eq!(harness.lookup.calls(), 0);
        assert_eq!(handler.selections(), 0);
        assert!(harness.balancer.tracked_destinations().await.is_empty());
        // mid_dialog notifications are enabled in the test app config
        assert_eq!(handler.notified(), vec![200]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mid_dialog_failure_does_not_fail_over() {
        let config = config_with_trunk(&[("sip:10.0.0.1", 1.0)]);
        let transport = ScriptedTransport::new(&[("10.0.0.1:5060", 200)]);
        let mut harness = Harness::new(&config, transport, CountingLookup::default());

        let bye = Request::new("BYE", SipUri::parse("sip:bob@192.0.2.99").unwrap())
            .with_header("To", "<sip:bob@example.com>;tag=1");
        let handle = harness
            .controller
            .on_request(TransactionId::generate(), bye, &app(TestHandler::new(Some("pstn")), ResponseInterest::none()))
            .await;

        let (_, response) = harness.next_response().await;
        assert_eq!(response.status, 503);
        assert_eq!(handle.wait_terminal().await, TransactionState::Failed);
        assert_eq!(harness.transport.sent_to(), vec!["192.0.2.99:5060"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_ascii_route_is_answered_not_dropped() {
        let config = config_with_trunk(&[("sip:10.0.0.1", 1.0)]);
        let mut harness = Harness::new(&config, ScriptedTransport::new(&[]), CountingLookup::default());

        let bye = Request::new("BYE", SipUri::parse("sip:bob@192.0.2.99").unwrap())
            .with_header("To", "<sip:bob@example.com>;tag=1")
            .with_header("Route", "ééé");
        let handle = harness
            .controller
            .on_request(TransactionId::generate(), bye, &app(TestHandler::new(Some("pstn")), ResponseInterest::none()))
            .await;

        let (_, response) = harness.next_response().await;
        assert_eq!(response.status, 404);
        assert_eq!(handle.wait_terminal().await, TransactionState::Failed);
        assert!(harness.transport.sent_to().is_empty());
        assert_eq!(harness.settled().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_task_panic_is_answered_with_500() {
        let config = config_with_trunk(&[("sip:10.0.0.1", 1.0)]);
        let transport = ScriptedTransport::new(&[("10.0.0.1:5060", 200)]).panicking_on("10.0.0.1:5060");
        let mut harness = Harness::new(&config, transport, CountingLookup::default());

        let handle = harness
            .controller
            .on_request(
                TransactionId::from("tx-panic"),
                invite("sip:+15551234@example.com"),
                &app(TestHandler::new(Some("pstn")), ResponseInterest::none()),
            )
            .await;

        let (id, response) = harness.next_response().await;
        assert_eq!(id.as_str(), "tx-panic");
        assert_eq!(response.status, 500);
        assert_eq!(handle.wait_terminal().await, TransactionState::Failed);
        assert_eq!(harness.upstream.responses().len(), 1);

        // Same supervision for in-dialog requests
        let bye = Request::new("BYE", SipUri::parse("sip:bob@10.0.0.1").unwrap())
            .with_header("To", "<sip:bob@example.com>;tag=1");
        harness
            .controller
            .on_request(TransactionId::from("tx-panic-bye"), bye, &app(TestHandler::new(None), ResponseInterest::none()))
            .await;
        let (id, response) = harness.next_response().await;
        assert_eq!(id.as_str(), "tx-panic-bye");
        assert_eq!(response.status, 500);
        assert_eq!(harness.settled().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_maintenance_rejects_synchronously() {
        let mut config = config_with_trunk(&[("sip:10.0.0.1", 1.0)]);
        config.maintenance.reason = "Down For Maintenance".to_string();
        let transport = ScriptedTransport::new(&[("10.0.0.1:5060", 200)]);
        let harness = Harness::new(&config, transport, CountingLookup::default());
        let handler = TestHandler::new(Some("pstn"));
        let app = ProxyAppConfig::new(handler.clone(), Arc::new(|| true), true, ResponseInterest::none(), None);

        let handle = harness
            .controller
            .on_request(TransactionId::from("tx-maint"), invite("sip:+15551234@example.com"), &app)
            .await;

        // Already answered when on_request returns
        let responses = harness.upstream.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].1.status, 503);
        assert_eq!(responses[0].1.reason, "Down For Maintenance");
        assert_eq!(handle.state(), TransactionState::Failed);
        assert_eq!(handler.selections(), 0);
        assert!(harness.transport.sent_to().is_empty());
        assert_eq!(harness.controller.active_transactions(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_late_result_after_completion_is_ignored() {
        let config = config_with_trunk(&[("sip:10.0.0.1", 1.0)]);
        let transport = ScriptedTransport::new(&[("10.0.0.1:5060", 200)]);
        let mut harness = Harness::new(&config, transport, CountingLookup::default());
        let app = app(TestHandler::new(Some("pstn")), ResponseInterest::none());

        let handle = harness
            .controller
            .on_request(TransactionId::generate(), invite("sip:+15551234@example.com"), &app)
            .await;
        harness.next_response().await;
        assert_eq!(handle.wait_terminal().await, TransactionState::Completed);

        let late_ok = harness
            .controller
            .on_egress_result(&handle, Ok(Response::new(500, "Server Internal Error")), &app)
            .await;
        let late_err = harness
            .controller
            .on_egress_result(&handle, Err(ProxyError::internal("late")), &app)
            .await;
        let late_timeout = harness.controller.on_timeout(&handle).await;

        assert!(!late_ok && !late_err && !late_timeout);
        assert_eq!(handle.state(), TransactionState::Completed);
        assert_eq!(harness.upstream.responses().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_answers_408() {
        let mut config = config_with_trunk(&[("sip:10.0.0.1", 1.0)]);
        config.transaction.timeout = "100ms".to_string();
        let transport = ScriptedTransport::new(&[("10.0.0.1:5060", 200)]).with_delay(Duration::from_secs(10));
        let mut harness = Harness::new(&config, transport, CountingLookup::default());

        let handle = harness
            .controller
            .on_request(
                TransactionId::generate(),
                invite("sip:+15551234@example.com"),
                &app(TestHandler::new(Some("pstn")), ResponseInterest::none()),
            )
            .await;

        let (_, response) = harness.next_response().await;
        assert_eq!(response.status, 408);
        assert_eq!(response.reason, "Request Timeout");
        assert_eq!(handle.wait_terminal().await, TransactionState::TimedOut);
        assert_eq!(harness.upstream.responses().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_answers_487_once() {
        let config = config_with_trunk(&[("sip:10.0.0.1", 1.0)]);
        let transport = ScriptedTransport::new(&[("10.0.0.1:5060", 200)]).with_delay(Duration::from_secs(10));
        let mut harness = Harness::new(&config, transport, CountingLookup::default());
        let id = TransactionId::from("tx-cancel");

        let handle = harness
            .controller
            .on_request(
                id.clone(),
                invite("sip:+15551234@example.com"),
                &app(TestHandler::new(Some("pstn")), ResponseInterest::none()),
            )
            .await;

        assert!(harness.controller.on_cancel(&id).await);
        let (_, response) = harness.next_response().await;
        assert_eq!(response.status, 487);
        assert_eq!(handle.wait_terminal().await, TransactionState::Failed);

        assert!(!harness.controller.on_cancel(&id).await);
        assert_eq!(harness.upstream.responses().len(), 1);
        assert_eq!(harness.controller.active_transactions(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unroutable_request_gets_404() {
        let config = config_with_trunk(&[("sip:10.0.0.1", 1.0)]);
        let harness = Harness::new(&config, ScriptedTransport::new(&[]), CountingLookup::default());

        let no_trunk = harness
            .controller
            .on_request(TransactionId::generate(), invite("sip:bob@example.com"), &app(TestHandler::new(None), ResponseInterest::none()))
            .await;
        let unknown_trunk = harness
            .controller
            .on_request(
                TransactionId::generate(),
                invite("sip:bob@example.com"),
                &app(TestHandler::new(Some("missing")), ResponseInterest::none()),
            )
            .await;

        assert_eq!(no_trunk.state(), TransactionState::Failed);
        assert_eq!(unknown_trunk.state(), TransactionState::Failed);
        let statuses: Vec<u16> = harness.upstream.responses().iter().map(|(_, r)| r.status).collect();
        assert_eq!(statuses, vec![404, 404]);
        assert!(harness.transport.sent_to().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolved_trunk_walks_srv_priorities() {
        let mut config = ProxyConfig::default();
        let mut trunk = static_trunk(&[]);
        trunk.target = TargetConfig::Resolve {
            name: "carrier.example.com".to_string(),
            transport: Some(Transport::Udp),
            port: None,
        };
        config.trunks.insert("carrier".to_string(), trunk);

        let mut lookup = CountingLookup::default();
        lookup.srv.insert(
            "_sip._udp.carrier.example.com".to_string(),
            vec![
                SrvRecord {
                    priority: 20,
                    weight: 0,
                    port: 5060,
                    target: "backup.carrier.example.com".to_string(),
                },
                SrvRecord {
                    priority: 10,
                    weight: 0,
                    port: 5060,
                    target: "primary.carrier.example.com".to_string(),
                },
            ],
        );
        lookup.hosts.insert(
            "primary.carrier.example.com".to_string(),
            vec!["198.51.100.1".parse::<IpAddr>().unwrap()],
        );
        lookup.hosts.insert(
            "backup.carrier.example.com".to_string(),
            vec!["198.51.100.2".parse::<IpAddr>().unwrap()],
        );

        let transport = ScriptedTransport::new(&[("198.51.100.1:5060", 503), ("198.51.100.2:5060", 200)]);
        let mut harness = Harness::new(&config, transport, lookup);

        harness
            .controller
            .on_request(
                TransactionId::generate(),
                invite("sip:+15551234@example.com"),
                &app(TestHandler::new(Some("carrier")), ResponseInterest::none()),
            )
            .await;

        let (_, response) = harness.next_response().await;
        assert_eq!(response.status, 200);
        assert_eq!(harness.transport.sent_to(), vec!["198.51.100.1:5060", "198.51.100.2:5060"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stray_response_is_normalized_and_relayed() {
        struct StripInternal;
        impl Normalization for StripInternal {
            fn normalize_response(&self, response: &mut Response) {
                response.headers.remove("X-Internal");
            }
        }

        let harness = Harness::new(&ProxyConfig::default(), ScriptedTransport::new(&[]), CountingLookup::default());
        let handler = TestHandler::new(None);
        let with_normalizer = ProxyAppConfig::new(
            handler.clone(),
            Arc::new(|| false),
            true,
            ResponseInterest::none(),
            Some(Arc::new(StripInternal)),
        );
        let without = ProxyAppConfig::new(
            handler,
            Arc::new(|| false),
            true,
            ResponseInterest::none(),
            Some(Arc::new(NoopNormalization)),
        );

        let mut stray = Response::new(200, "OK");
        stray.headers.append("X-Internal", "1");
        harness.controller.on_stray_response(stray.clone(), &with_normalizer);
        harness.controller.on_stray_response(stray, &without);

        let relayed = harness.upstream.relayed();
        assert_eq!(relayed.len(), 2);
        assert!(!relayed[0].headers.contains("X-Internal"));
        assert!(relayed[1].headers.contains("X-Internal"));
        assert!(harness.upstream.responses().is_empty());
    }
}
