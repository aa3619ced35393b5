//! Dormancy routing, flushes, streamed regions and destruction notices.

use super::support::*;
use crate::info::ObjectDescriptor;
use crate::settings::{RoutingPolicy, SpatialMode};
use crate::types::{CloseReason, NetDormancy, NetObjectId, NetViewer, Vec3};

fn dormancy_props(graph: &mut TestGraph) {
    let settings = graph
        .class_template()
        .with_routing(RoutingPolicy::Spatialize(SpatialMode::Dormancy));
    graph.set_class_settings("Prop", settings);
}

fn global_crates(graph: &mut TestGraph) {
    let settings = graph.class_template().with_routing(RoutingPolicy::RelevantAllConnections);
    graph.set_class_settings("Crate", settings);
}

fn dormant_prop(id: u64) -> ObjectDescriptor {
    ObjectDescriptor::new(NetObjectId(id), "Prop")
        .at(Vec3::new(600.0, 500.0, 0.0))
        .with_dormancy(NetDormancy::DormantAll)
}

#[test]
fn test_dormant_object_stops_until_flushed() {
    let mut graph = graph();
    dormancy_props(&mut graph);
    graph.transport_mut().dormant_immediately = true;
    let player = graph.add_connection(NetViewer::at(Vec3::new(500.0, 500.0, 0.0)));
    let handle = graph.register_object(dormant_prop(1)).unwrap();

    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);
    let info = graph.connection(player).unwrap().infos().get(handle).unwrap();
    assert!(info.dormant_on_connection);
    assert_eq!(info.channel, None);

    graph.transport_mut().clear();
    let stats = tick(&mut graph);
    assert_eq!(stats.sends, 0);

    graph.flush_dormancy(NetObjectId(1)).unwrap();
    graph.flush_dormancy(NetObjectId(1)).unwrap();
    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);

    graph.transport_mut().clear();
    tick(&mut graph);
    assert!(graph.transport().sent_to(player).is_empty());
}

#[test]
fn test_dormant_intent_object_stays_out_of_active_lists() {
    let mut graph = graph();
    dormancy_props(&mut graph);
    graph.transport_mut().dormant_immediately = true;
    let player = graph.add_connection(NetViewer::at(Vec3::new(500.0, 500.0, 0.0)));
    let handle = graph.register_object(dormant_prop(1)).unwrap();
    assert!(graph.grid().unwrap().is_static(handle));
    assert!(!graph.grid().unwrap().is_dynamic(handle));

    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);
    let grid = graph.grid().unwrap();
    let (x, y) = grid.viewer_cell(Vec3::new(600.0, 500.0, 0.0));
    assert!(grid
        .cell(x, y)
        .and_then(|cell| cell.dormancy())
        .is_some_and(|node| node.contains(handle)));

    // Dormant on the connection from here on: no lane offers it again.
    graph.transport_mut().clear();
    for _ in 0..5 {
        let stats = tick(&mut graph);
        assert_eq!(stats.candidates, 0);
        assert!(!graph.grid().unwrap().is_dynamic(handle));
    }
    assert!(graph.transport().sends.is_empty());
}

/// A viewer just past the prop's cull distance but inside one of its cells.
fn trickle_graph(trickle_enabled: bool) -> (TestGraph, crate::types::ConnectionHandle) {
    let mut config = test_config();
    config.dormancy.trickle_enabled = trickle_enabled;
    config.dormancy.trickle_start_counter = 10;
    let mut graph = graph_with(config, MockTransport::new());
    dormancy_props(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::new(2_900.0, 500.0, 0.0)));
    graph.register_object(dormant_prop(1)).unwrap();
    (graph, player)
}

#[test]
fn test_trickle_sends_culled_dormant_object_after_start_counter() {
    let (mut graph, player) = trickle_graph(true);

    for _ in 0..10 {
        let stats = tick(&mut graph);
        assert_eq!(stats.sends, 0);
    }
    let stats = tick(&mut graph);
    assert_eq!(stats.sends, 1);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);
}

#[test]
fn test_disabled_trickle_leaves_culled_object_alone() {
    let (mut graph, player) = trickle_graph(false);

    for _ in 0..20 {
        tick(&mut graph);
    }
    assert!(graph.transport().sent_to(player).is_empty());
}

#[test]
fn test_flush_of_awake_object_is_a_no_op() {
    let mut graph = graph();
    global_crates(&mut graph);
    graph.add_connection(NetViewer::at(Vec3::zero()));
    graph.register_object(ObjectDescriptor::new(NetObjectId(1), "Crate")).unwrap();

    graph.flush_dormancy(NetObjectId(1)).unwrap();
    let info = graph.object_info(NetObjectId(1)).unwrap();
    assert_eq!(info.dormancy, NetDormancy::Awake);
    assert!(info.routed);
}

#[test]
fn test_flush_while_awake_does_not_use_up_the_frame() {
    let mut graph = graph();
    global_crates(&mut graph);
    graph.add_connection(NetViewer::at(Vec3::zero()));
    graph.register_object(ObjectDescriptor::new(NetObjectId(1), "Crate")).unwrap();
    tick(&mut graph);

    graph.flush_dormancy(NetObjectId(1)).unwrap();
    assert_eq!(graph.object_info(NetObjectId(1)).unwrap().last_flush_dormancy_frame, 0);

    // Going dormant later in the same frame still allows a flush.
    graph.notify_dormancy_changed(NetObjectId(1), NetDormancy::DormantAll).unwrap();
    graph.flush_dormancy(NetObjectId(1)).unwrap();
    assert_eq!(graph.object_info(NetObjectId(1)).unwrap().last_flush_dormancy_frame, graph.frame());
}

#[test]
fn test_waking_moves_object_to_dynamic_grid() {
    let mut graph = graph();
    dormancy_props(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::new(500.0, 500.0, 0.0)));
    let handle = graph.register_object(dormant_prop(1)).unwrap();
    assert!(graph.grid().unwrap().is_static(handle));

    tick(&mut graph);
    graph.notify_dormancy_changed(NetObjectId(1), NetDormancy::Awake).unwrap();
    // Node migration waits for Prepare.
    assert!(graph.grid().unwrap().is_static(handle));

    graph.transport_mut().clear();
    tick(&mut graph);
    assert!(graph.grid().unwrap().is_dynamic(handle));
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);

    graph.notify_dormancy_changed(NetObjectId(1), NetDormancy::DormantAll).unwrap();
    tick(&mut graph);
    assert!(graph.grid().unwrap().is_static(handle));
    assert!(graph.verify_membership(NetObjectId(1)).is_ok());
}

#[test]
fn test_level_placed_dormant_object_waits_for_first_flush() {
    let mut graph = graph();
    dormancy_props(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::new(500.0, 500.0, 0.0)));
    let handle = graph
        .register_object(dormant_prop(1).with_dormancy(NetDormancy::Initial).net_startup())
        .unwrap();

    assert!(!graph.object_info(NetObjectId(1)).unwrap().routed);
    assert!(!graph.is_in_any_node(handle));
    let stats = tick(&mut graph);
    assert_eq!(stats.candidates, 0);

    graph.flush_dormancy(NetObjectId(1)).unwrap();
    let info = graph.object_info(NetObjectId(1)).unwrap();
    assert!(info.routed);
    assert_eq!(info.dormancy, NetDormancy::DormantAll);

    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);
}

#[test]
fn test_waking_level_placed_object_routes_it() {
    let mut graph = graph();
    dormancy_props(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::new(500.0, 500.0, 0.0)));
    let handle = graph
        .register_object(dormant_prop(1).with_dormancy(NetDormancy::Initial).net_startup())
        .unwrap();

    graph.notify_dormancy_changed(NetObjectId(1), NetDormancy::Awake).unwrap();
    assert!(graph.grid().unwrap().is_dynamic(handle));
    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);
}

#[test]
fn test_fully_dormant_connection_skips_object_until_awake() {
    let mut graph = graph();
    global_crates(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::zero()));
    graph
        .register_object(ObjectDescriptor::new(NetObjectId(1), "Crate").with_dormancy(NetDormancy::DormantAll))
        .unwrap();

    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player).len(), 1);

    graph.notify_fully_dormant(player, NetObjectId(1)).unwrap();
    graph.transport_mut().clear();
    let stats = tick(&mut graph);
    assert_eq!(stats.sends, 0);

    graph.notify_dormancy_changed(NetObjectId(1), NetDormancy::Awake).unwrap();
    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);
}

#[test]
fn test_region_objects_need_a_loaded_region() {
    let mut graph = graph();
    global_crates(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::zero()));
    graph
        .register_object(ObjectDescriptor::new(NetObjectId(1), "Crate").in_region("Harbor"))
        .unwrap();

    tick(&mut graph);
    assert!(graph.transport().sent_to(player).is_empty());

    graph.set_client_visible_regions(player, ["Harbor"]).unwrap();
    assert!(graph.connection(player).unwrap().is_region_visible(Some("Harbor")));
    tick(&mut graph);
    assert_eq!(graph.transport().sent_to(player), vec![NetObjectId(1)]);
}

#[test]
fn test_destroyed_level_object_notifies_clients_with_region_loaded() {
    let mut graph = graph();
    global_crates(&mut graph);
    let loaded = graph.add_connection(NetViewer::at(Vec3::zero()));
    let unloaded = graph.add_connection(NetViewer::at(Vec3::zero()));
    graph.set_client_visible_regions(loaded, ["Harbor"]).unwrap();
    graph
        .register_object(
            ObjectDescriptor::new(NetObjectId(1), "Crate")
                .at(Vec3::new(10_000.0, 0.0, 0.0))
                .in_region("Harbor")
                .net_startup(),
        )
        .unwrap();

    // Out of cull range, so no channel is ever opened.
    tick(&mut graph);
    graph.unregister_object(NetObjectId(1)).unwrap();
    assert_eq!(graph.connection(loaded).unwrap().pending_destructions().len(), 1);
    assert!(graph.connection(unloaded).unwrap().pending_destructions().is_empty());

    let stats = tick(&mut graph);
    assert_eq!(stats.destruction_infos_sent, 1);
    assert_eq!(
        graph.transport().destructions,
        vec![(loaded, NetObjectId(1), CloseReason::Destroyed)]
    );
    assert!(graph.connection(loaded).unwrap().pending_destructions().is_empty());
}

#[test]
fn test_far_viewer_keeps_destruction_pending() {
    let mut graph = graph();
    global_crates(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::new(40_000.0, 0.0, 0.0)));
    graph.set_client_visible_regions(player, ["Harbor"]).unwrap();
    graph
        .register_object(ObjectDescriptor::new(NetObjectId(1), "Crate").in_region("Harbor").net_startup())
        .unwrap();
    graph.unregister_object(NetObjectId(1)).unwrap();

    tick(&mut graph);
    assert!(graph.transport().destructions.is_empty());
    assert_eq!(graph.connection(player).unwrap().pending_destructions().len(), 1);

    graph.set_viewer(player, NetViewer::at(Vec3::new(1_000.0, 0.0, 0.0))).unwrap();
    tick(&mut graph);
    assert_eq!(graph.transport().destructions.len(), 1);
}

#[test]
fn test_unloading_region_drops_pending_destructions() {
    let mut graph = graph();
    global_crates(&mut graph);
    let player = graph.add_connection(NetViewer::at(Vec3::new(40_000.0, 0.0, 0.0)));
    graph.set_client_visible_regions(player, ["Harbor"]).unwrap();
    graph
        .register_object(ObjectDescriptor::new(NetObjectId(1), "Crate").in_region("Harbor").net_startup())
        .unwrap();
    graph.unregister_object(NetObjectId(1)).unwrap();

    graph
        .set_client_visible_regions(player, std::iter::empty::<String>())
        .unwrap();
    assert!(graph.connection(player).unwrap().pending_destructions().is_empty());
    tick(&mut graph);
    assert!(graph.transport().destructions.is_empty());
}
