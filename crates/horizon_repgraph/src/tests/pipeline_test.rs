//! Default-lane pipeline: gather, prioritize, send and cleanup.

use super::support::*;
use crate::error::GraphError;
use crate::info::ObjectDescriptor;
use crate::nodes::{ActorListNode, InterestNode};
use crate::settings::{RoutingPolicy, SpatialMode};
use crate::types::{CloseReason, NetObjectId, NetViewer, Vec3};

fn spatial_pawns(graph: &mut TestGraph) {
    let settings = graph
        .class_template()
        .with_routing(RoutingPolicy::Spatialize(SpatialMode::Dynamic));
    graph.set_class_settings("Pawn", settings);
}

fn global_crates(graph: &mut TestGraph) {
    let settings = graph.class_template().with_routing(RoutingPolicy::RelevantAllConnections);
    graph.set_class_settings("Crate", settings);
}

#[test]
fn test_nearby_object_is_sent() {
    let mut graph = graph();
    spatial_pawns(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::new(500.0, 500.0, 0.0)));
    graph
        .register_object(ObjectDescriptor::new(NetObjectId(1), "Pawn").at(Vec3::new(800.0, 500.0, 0.0)))
        .unwrap();

    let stats = tick(&mut graph);
    assert_eq!(stats.frame, 1);
    assert_eq!(stats.sends, 1);
    assert_eq!(stats.channel_opens, 1);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);
    assert_eq!(graph.world().pre_replications, vec![(NetObjectId(1), 1)]);
    assert_eq!(graph.frame(), 2);
}

#[test]
fn test_object_gathered_twice_is_sent_once() {
    let mut graph = graph();
    global_crates(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::zero()));
    graph
        .register_object(ObjectDescriptor::new(NetObjectId(1), "Crate").at(Vec3::new(100.0, 0.0, 0.0)))
        .unwrap();

    let local = graph
        .add_connection_node(player, InterestNode::ActorList(ActorListNode::new()))
        .unwrap();
    graph.add_to_connection_node(player, local, NetObjectId(1)).unwrap();

    let stats = tick(&mut graph);
    assert_eq!(stats.candidates, 2);
    assert_eq!(stats.sends, 1);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);
}

#[test]
fn test_out_of_range_object_is_culled() {
    let mut graph = graph();
    global_crates(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::zero()));
    graph
        .register_object(ObjectDescriptor::new(NetObjectId(1), "Crate").at(Vec3::new(50_000.0, 0.0, 0.0)))
        .unwrap();

    let stats = tick(&mut graph);
    assert_eq!(stats.culled, 1);
    assert!(graph.transport().sent_to(player).is_empty());

    // A split-screen child standing next to it brings it back.
    graph
        .add_child_viewer(player, NetViewer::at(Vec3::new(49_500.0, 0.0, 0.0)))
        .unwrap();
    let stats = tick(&mut graph);
    assert_eq!(stats.culled, 0);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);
}

#[test]
fn test_identical_inputs_send_identical_sequences() {
    let run = || {
        let mut graph = graph_with(test_config(), MockTransport::with_budget(5 * BITS_PER_SEND));
        spatial_pawns(&mut graph);
        global_crates(&mut graph);
        graph.add_connection(NetViewer::at(Vec3::new(500.0, 500.0, 0.0)));
        graph.add_connection(NetViewer::at(Vec3::new(1_500.0, 900.0, 0.0)));
        for id in 0..20u64 {
            let class = if id % 2 == 0 { "Pawn" } else { "Crate" };
            let location = Vec3::new(100.0 * id as f64, 50.0 * id as f64, 0.0);
            graph
                .register_object(ObjectDescriptor::new(NetObjectId(id), class).at(location))
                .unwrap();
        }

        let mut sequence = Vec::new();
        for _ in 0..5 {
            tick(&mut graph);
            sequence.extend(graph.transport().sends.iter().map(|sent| sent.object));
            graph.transport_mut().clear();
        }
        sequence
    };

    let first = run();
    assert!(!first.is_empty());
    assert_eq!(first, run());
}

#[test]
fn test_unregister_leaves_no_residue() {
    let mut graph = graph();
    spatial_pawns(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::new(500.0, 500.0, 0.0)));
    let handle = graph
        .register_object(ObjectDescriptor::new(NetObjectId(1), "Pawn").at(Vec3::new(600.0, 500.0, 0.0)))
        .unwrap();
    tick(&mut graph);
    let channel = graph.transport().channel_of(player, NetObjectId(1)).unwrap();

    graph.unregister_object(NetObjectId(1)).unwrap();

    assert!(!graph.is_registered(NetObjectId(1)));
    assert!(!graph.is_in_any_node(handle));
    assert!(!graph.connection(player).unwrap().infos().contains(handle));
    assert!(graph
        .transport()
        .closed
        .contains(&(player, channel, CloseReason::Destroyed)));

    graph.transport_mut().clear();
    let stats = tick(&mut graph);
    assert_eq!(stats.candidates, 0);
    assert_eq!(
        graph.unregister_object(NetObjectId(1)),
        Err(GraphError::ObjectNotRegistered(NetObjectId(1)))
    );
}

#[test]
fn test_register_is_idempotent_per_class() {
    let mut graph = graph();
    global_crates(&mut graph);
    spatial_pawns(&mut graph);
    let first = graph.register_object(ObjectDescriptor::new(NetObjectId(1), "Crate")).unwrap();
    let again = graph.register_object(ObjectDescriptor::new(NetObjectId(1), "Crate")).unwrap();
    assert_eq!(first, again);
    assert_eq!(graph.object_count(), 1);

    assert_eq!(
        graph.register_object(ObjectDescriptor::new(NetObjectId(1), "Pawn")),
        Err(GraphError::AlreadyRegistered(NetObjectId(1)))
    );
    assert!(matches!(
        graph.register_object(ObjectDescriptor::new(NetObjectId(2), "Crate").at(Vec3::new(f64::NAN, 0.0, 0.0))),
        Err(GraphError::IneligibleObject(..))
    ));
}

#[test]
fn test_force_update_is_idempotent() {
    let mut graph = graph();
    let settings = graph
        .class_template()
        .with_routing(RoutingPolicy::RelevantAllConnections)
        .with_period(10);
    graph.set_class_settings("Door", settings);
    let player = graph.add_connection(NetViewer::at(Vec3::zero()));
    graph.register_object(ObjectDescriptor::new(NetObjectId(1), "Door")).unwrap();

    tick(&mut graph);
    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player).len(), 1);

    graph.force_update(NetObjectId(1)).unwrap();
    graph.force_update(NetObjectId(1)).unwrap();
    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player).len(), 2);

    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player).len(), 2);
}

#[test]
fn test_saturation_stops_sends_and_starved_objects_go_first_next_tick() {
    let mut graph = graph_with(test_config(), MockTransport::with_budget(3 * BITS_PER_SEND));
    global_crates(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::zero()));
    for id in 1..=5u64 {
        graph
            .register_object(ObjectDescriptor::new(NetObjectId(id), "Crate").at(Vec3::new(600.0, 0.0, 0.0)))
            .unwrap();
    }

    let stats = tick(&mut graph);
    assert_eq!(stats.sends, 3);
    assert_eq!(stats.saturations, 1);
    assert_eq!(graph.transport().saturation_notices, 1);
    let first: Vec<NetObjectId> = graph.transport().sent_to(player);

    graph.transport_mut().clear();
    tick(&mut graph);
    let second = graph.transport().sent_to(player);
    assert_eq!(second.len(), 3);
    for starved in second.iter().take(2) {
        assert!(!first.contains(starved), "{} was sent last tick", starved);
    }
}

#[test]
fn test_saturated_connection_sends_nothing() {
    let mut graph = graph_with(test_config(), MockTransport::with_budget(BITS_PER_SEND));
    global_crates(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::zero()));
    graph.register_object(ObjectDescriptor::new(NetObjectId(1), "Crate")).unwrap();
    graph.transport_mut().outstanding.insert(player, BITS_PER_SEND);

    let stats = tick(&mut graph);
    assert_eq!(stats.sends, 0);
    assert_eq!(stats.saturations, 1);
}

#[test]
fn test_saturation_keeps_skipped_channels_open() {
    let mut graph = graph();
    global_crates(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::zero()));
    let handles: Vec<_> = (1..=3)
        .map(|id| graph.register_object(ObjectDescriptor::new(NetObjectId(id), "Crate")).unwrap())
        .collect();
    tick(&mut graph);
    assert_eq!(graph.transport().opened.len(), 3);

    let close_frames: Vec<_> = handles
        .iter()
        .map(|handle| graph.connection(player).unwrap().infos().get(*handle).unwrap().channel_close_frame())
        .collect();

    // Nothing drains the queue, so every later tick starts saturated.
    graph.transport_mut().budget_bits = Some(BITS_PER_SEND);
    graph.transport_mut().sends.clear();
    for _ in 0..10 {
        let stats = tick(&mut graph);
        assert_eq!(stats.sends, 0);
        assert_eq!(stats.saturations, 1);
    }

    assert!(graph.frame() > close_frames.iter().copied().max().unwrap());
    assert!(graph.transport().closed.is_empty());
    for (handle, before) in handles.iter().zip(close_frames) {
        let info = graph.connection(player).unwrap().infos().get(*handle).unwrap();
        assert!(info.channel_close_frame() > before);
        assert!(info.channel.is_some());
    }
}

#[test]
fn test_failed_channel_open_retries_next_tick() {
    let mut graph = graph();
    global_crates(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::zero()));
    graph.register_object(ObjectDescriptor::new(NetObjectId(1), "Crate")).unwrap();
    graph.transport_mut().fail_opens.insert(NetObjectId(1));

    let stats = tick(&mut graph);
    assert_eq!(stats.sends, 0);
    assert_eq!(stats.channel_open_failures, 1);

    graph.transport_mut().fail_opens.clear();
    let stats = tick(&mut graph);
    assert_eq!(stats.sends, 1);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);
}

#[test]
fn test_idle_channel_closes_after_timeout() {
    let mut graph = graph();
    global_crates(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::zero()));
    let handle = graph
        .register_object(ObjectDescriptor::new(NetObjectId(1), "Crate").at(Vec3::new(100.0, 0.0, 0.0)))
        .unwrap();
    tick(&mut graph);
    let channel = graph.transport().channel_of(player, NetObjectId(1)).unwrap();

    // Out of range from now on, so nothing extends the close frame.
    graph
        .world_mut()
        .locations
        .insert(NetObjectId(1), Vec3::new(90_000.0, 0.0, 0.0));
    for _ in 0..10 {
        tick(&mut graph);
    }

    assert!(graph
        .transport()
        .closed
        .contains(&(player, channel, CloseReason::Relevancy)));
    let info = graph.connection(player).unwrap().infos().get(handle).unwrap();
    assert_eq!(info.channel, None);
    assert_eq!(info.last_rep_frame, 0);
}

#[test]
fn test_discovery_traffic_is_refunded() {
    let mut graph = graph();
    global_crates(&mut graph);
    graph.add_connection(NetViewer::at(Vec3::zero()));
    graph.register_object(ObjectDescriptor::new(NetObjectId(1), "Crate")).unwrap();
    graph.transport_mut().spawns_unacked = true;
    graph.set_discovery_budget(10_000);
    assert_eq!(graph.discovery_max_bits_per_frame(), 10_000 * 8 / 30);

    let stats = tick(&mut graph);
    assert_eq!(stats.discovery_bits, BITS_PER_SEND);
    assert_eq!(graph.transport().refunded_bits, BITS_PER_SEND);

    graph.set_discovery_budget(0);
    assert_eq!(graph.discovery_max_bits_per_frame(), 0);
}

#[test]
fn test_tear_off_sends_once_more_then_closes() {
    let mut graph = graph();
    global_crates(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::zero()));
    graph
        .register_object(ObjectDescriptor::new(NetObjectId(1), "Crate").at(Vec3::new(100.0, 0.0, 0.0)))
        .unwrap();
    tick(&mut graph);
    let channel = graph.transport().channel_of(player, NetObjectId(1)).unwrap();

    graph.notify_tear_off(NetObjectId(1)).unwrap();
    graph.transport_mut().clear();
    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);
    assert!(graph
        .transport()
        .closed
        .contains(&(player, channel, CloseReason::TearOff)));

    graph.transport_mut().clear();
    tick(&mut graph);
    tick(&mut graph);
    assert!(graph.transport().sent_to(player).is_empty());
}

#[test]
fn test_viewer_pawn_is_relevant_from_any_range() {
    let mut graph = graph();
    let settings = graph.class_template().with_routing(RoutingPolicy::NotRouted);
    graph.set_class_settings("Hero", settings);
    let viewer = NetViewer::at(Vec3::zero()).with_viewer(NetObjectId(7));
    let player = graph.add_connection(viewer);
    graph
        .register_object(ObjectDescriptor::new(NetObjectId(7), "Hero").at(Vec3::new(80_000.0, 0.0, 0.0)))
        .unwrap();

    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(7)]);
}

#[test]
fn test_owner_relevant_object_only_reaches_owner() {
    let mut graph = graph();
    let settings = graph.class_template().with_routing(RoutingPolicy::RelevantOwnerConnection);
    graph.set_class_settings("PlayerState", settings);
    let owner = graph.add_connection(NetViewer::at(Vec3::zero()));
    let other = graph.add_connection(NetViewer::at(Vec3::zero()));
    graph
        .register_object(ObjectDescriptor::new(NetObjectId(1), "PlayerState").owned_by(owner))
        .unwrap();

    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(owner), vec![NetObjectId(1)]);
    assert!(graph.transport().sent_to(other).is_empty());
    assert!(graph.verify_membership(NetObjectId(1)).is_ok());
}

#[test]
fn test_dependents_follow_their_owner() {
    let mut graph = graph();
    global_crates(&mut graph);
    let settings = graph.class_template().with_routing(RoutingPolicy::NotRouted);
    graph.set_class_settings("Weapon", settings);
    let player = graph.add_connection(NetViewer::at(Vec3::zero()));
    graph.register_object(ObjectDescriptor::new(NetObjectId(1), "Crate")).unwrap();
    graph.register_object(ObjectDescriptor::new(NetObjectId(2), "Weapon")).unwrap();
    graph.add_dependent(NetObjectId(1), NetObjectId(2)).unwrap();
    assert!(graph.add_dependent(NetObjectId(1), NetObjectId(1)).is_err());

    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1), NetObjectId(2)]);

    graph.remove_dependent(NetObjectId(1), NetObjectId(2)).unwrap();
    graph.transport_mut().clear();
    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);
}

#[test]
fn test_paused_and_throttled_ticks_are_skipped() {
    let mut config = test_config();
    config.general.target_updates_per_second = 10.0;
    let mut graph = graph_with(config, MockTransport::new());

    assert!(graph.tick(0.05).is_none());
    assert!(graph.tick(0.06).is_some());
    assert_eq!(graph.frame(), 2);

    graph.set_paused(true);
    assert!(graph.tick(1.0).is_none());
    assert_eq!(graph.frame(), 2);
    assert_eq!(graph.stats().skipped_ticks, 2);
    assert_eq!(graph.stats().ticks, 1);
}

#[test]
fn test_builtin_global_nodes_cannot_be_removed() {
    let mut graph = graph();
    let grid = graph.grid_node();
    assert_eq!(graph.remove_global_node(grid).err(), Some(GraphError::BuiltInNode(grid)));

    let key = graph.add_global_node(InterestNode::ActorList(ActorListNode::new()));
    assert!(graph.remove_global_node(key).is_ok());
    assert_eq!(graph.remove_global_node(key).err(), Some(GraphError::NodeNotFound(key)));
}

#[test]
fn test_class_routed_to_custom_node() {
    let mut graph = graph();
    let key = graph.add_global_node(InterestNode::ActorList(ActorListNode::new()));
    let settings = graph.class_template().with_routing(RoutingPolicy::Node(key));
    graph.set_class_settings("Flag", settings);
    let player = graph.add_connection(NetViewer::at(Vec3::zero()));
    graph.register_object(ObjectDescriptor::new(NetObjectId(3), "Flag")).unwrap();

    assert!(graph.global_node(key).unwrap().contains(graph.handle_of(NetObjectId(3)).unwrap()));
    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(3)]);

    assert!(matches!(graph.class_settings("Unknown"), Err(GraphError::UnknownClass(_))));
}

#[test]
fn test_always_relevant_class_reaches_everyone() {
    let mut graph = graph();
    let settings = graph.class_template().with_routing(RoutingPolicy::NotRouted);
    graph.set_class_settings("GameState", settings);
    graph.add_always_relevant_class("GameState");
    let a = graph.add_connection(NetViewer::at(Vec3::zero()));
    let b = graph.add_connection(NetViewer::at(Vec3::new(90_000.0, 0.0, 0.0)));
    graph.register_object(ObjectDescriptor::new(NetObjectId(1), "GameState").at(Vec3::zero())).unwrap();

    // Both gather it; the far one culls it by distance.
    let stats = tick(&mut graph);
    assert_eq!(stats.candidates, 2);
    assert_eq!(graph.transport().sent_to(a), vec![NetObjectId(1)]);
    assert!(graph.transport().sent_to(b).is_empty());
}

#[test]
fn test_removed_connection_is_forgotten() {
    let mut graph = graph();
    global_crates(&mut graph);
    let a = graph.add_connection(NetViewer::at(Vec3::zero()));
    let b = graph.add_connection(NetViewer::at(Vec3::zero()));
    graph.register_object(ObjectDescriptor::new(NetObjectId(1), "Crate")).unwrap();

    graph.remove_connection(a).unwrap();
    assert_eq!(graph.remove_connection(a), Err(GraphError::ConnectionNotFound(a)));
    assert_eq!(graph.connection_count(), 1);

    let stats = tick(&mut graph);
    assert_eq!(stats.connections, 1);
    assert_eq!(graph.transport().sent_to(b), vec![NetObjectId(1)]);
}
