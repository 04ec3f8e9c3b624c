//! Fleet supervisor lifecycle and fan-out over simulated vehicles.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use dronefleet::protocol::mav::{MavCmd, MavResult};
use dronefleet::sim::SimulatedVehicle;
use dronefleet::{
    Arg, ConnectRequest, DispatchError, DispatchMode, Fence, FleetError, LinkState, ManualInput,
    VehicleError, Waypoint,
};

use common::{as_strs, connect_all, sim_address, sim_fleet, wait_until};

fn two_vehicles() -> Vec<SimulatedVehicle> {
    vec![SimulatedVehicle::new(1), SimulatedVehicle::new(2)]
}

#[tokio::test]
async fn test_connect_registers_under_unique_name_and_location() {
    let (fleet, sim) = sim_fleet(&two_vehicles());
    let names = connect_all(&fleet, 2).await;
    assert_eq!(fleet.names(), names);

    let v0 = fleet.vehicle("v0").unwrap();
    assert_eq!(v0.state(), LinkState::Connected);
    assert!(v0.is_connected());
    assert_eq!(v0.relay().vehicle_identity().map(|i| i.system_id), Some(1));

    // Same name, different address.
    let err = fleet
        .connect(ConnectRequest::new("v0", sim_address(5).to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::DuplicateName(ref n) if n == "v0"), "{err}");

    // Different name, same location spelled differently.
    let err = fleet
        .connect(ConnectRequest::new("other", "udp://0.0.0.0:14540"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, FleetError::DuplicateAddress { ref existing, .. } if existing == "v0"),
        "{err}"
    );

    let err = fleet
        .connect(ConnectRequest::new("bad", "tcp://nowhere"))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Address(_)), "{err}");

    assert_eq!(fleet.len(), 2);
    fleet.close().await;
    assert!(fleet.is_empty());
    sim.shutdown().await;
}

#[tokio::test]
async fn test_connect_timeout_leaves_nothing_behind() {
    let (fleet, sim) = sim_fleet(&[SimulatedVehicle::new(1).silent()]);

    let err = fleet
        .connect(ConnectRequest::new("mute", sim_address(0).to_string()).timeout(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::ConnectTimeout { ref name, .. } if name == "mute"), "{err}");
    assert!(fleet.is_empty());

    // Name and location were released.
    let err = fleet
        .connect(ConnectRequest::new("mute", sim_address(0).to_string()).timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::ConnectTimeout { .. }), "{err}");

    fleet.close().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_connect_leaves_nothing_behind() {
    let (fleet, sim) = sim_fleet(&[SimulatedVehicle::new(1).silent()]);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = fleet
        .connect(ConnectRequest::new("mute", sim_address(0).to_string()).cancel_on(cancel))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::CancelledConnect(ref n) if n == "mute"), "{err}");
    assert!(fleet.is_empty());

    fleet.close().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_failing_connect_hook_undoes_the_connect() {
    let (fleet, sim) = sim_fleet(&[SimulatedVehicle::new(1)]);
    fleet.on_vehicle_connected(|name: String, _vehicle| async move {
        Err(anyhow::anyhow!("refusing {name}"))
    });

    let err = fleet
        .connect(ConnectRequest::new("v0", sim_address(0).to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::HookFailed { .. }), "{err}");
    assert!(fleet.is_empty());

    fleet.close().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_arm_takeoff_land_fan_out() {
    let vehicles = two_vehicles();
    let (fleet, sim) = sim_fleet(&vehicles);
    let names = connect_all(&fleet, 2).await;
    let names = as_strs(&names);

    let report = fleet.arm(&names).await.unwrap();
    assert!(report.all_ok(), "{report}");
    assert!(vehicles.iter().all(SimulatedVehicle::is_armed));
    assert!(fleet.vehicle("v1").unwrap().is_armed());

    let report = fleet
        .takeoff(&names, Arg::PerVehicle(vec![5.0, 8.0]))
        .await
        .unwrap();
    assert!(report.all_ok(), "{report}");
    assert!((vehicles[0].position()[2] + 5.0).abs() < 1e-6);
    assert!((vehicles[1].position()[2] + 8.0).abs() < 1e-6);

    assert!(fleet.land(&names).await.unwrap().all_ok());
    assert!(fleet.disarm(&names).await.unwrap().all_ok());
    assert!(!vehicles[0].is_armed());

    fleet.close().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_one_vehicle_failing_does_not_affect_siblings() {
    let vehicles = vec![
        SimulatedVehicle::new(1),
        SimulatedVehicle::new(2).with_command_result(MavResult::MAV_RESULT_DENIED),
    ];
    let (fleet, sim) = sim_fleet(&vehicles);
    let names = connect_all(&fleet, 2).await;
    let names = as_strs(&names);

    let report = fleet.arm(&names).await.unwrap();
    assert!(report.get("v0").unwrap().is_ok());
    let err = report.get("v1").unwrap().as_ref().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<VehicleError>(),
        Some(VehicleError::CommandRejected { .. })
    ));
    assert!(vehicles[0].is_armed());
    assert_eq!(report.succeeded().collect::<Vec<_>>(), vec!["v0"]);

    // A panicking action is captured the same way.
    let report = fleet
        .dispatch("count", &names, DispatchMode::Execute, (), |vehicle, ()| async move {
            if vehicle.name() == "v1" {
                panic!("action bug");
            }
            Ok(vehicle.name().to_string())
        })
        .await
        .unwrap();
    assert_eq!(report.get("v0").unwrap().as_ref().unwrap(), "v0");
    let (failed, err) = report.failed().next().unwrap();
    assert_eq!(failed, "v1");
    assert!(err.to_string().contains("action bug"));

    fleet.close().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_argument_mismatch_runs_nothing() {
    let vehicles = two_vehicles();
    let (fleet, sim) = sim_fleet(&vehicles);
    let names = connect_all(&fleet, 2).await;
    let names = as_strs(&names);

    let err = fleet
        .takeoff(&names, Arg::PerVehicle(vec![10.0]))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::ArgumentMismatch { expected: 2, got: 1 });

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let err = fleet
        .dispatch(
            "count",
            &names,
            DispatchMode::Execute,
            (Arg::Shared(1u8), Arg::PerVehicle(vec![1u8, 2, 3])),
            move |_vehicle, _item| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::ArgumentMismatch { expected: 2, got: 3 });
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(vehicles.iter().all(|v| v.commands().is_empty()));

    let err = fleet.arm(&["v0", "ghost"]).await.unwrap_err();
    assert_eq!(err, DispatchError::UnknownVehicles(vec!["ghost".to_string()]));
    assert!(!vehicles[0].is_armed());

    fleet.close().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_goto_is_gated_by_the_fence() {
    let vehicle = SimulatedVehicle::new(1);
    let (fleet, sim) = sim_fleet(&[vehicle.clone()]);
    let names = connect_all(&fleet, 1).await;
    let names = as_strs(&names);

    let fence = Fence::new((-5.0, 5.0), (-5.0, 5.0), (-10.0, 0.0), 1).unwrap();
    assert!(fleet.set_fence(&names, Arg::Shared(Some(fence))).await.unwrap().all_ok());

    let report = fleet
        .goto(&names, Arg::Shared(Waypoint::ned(6.0, 0.0, -2.0)))
        .await
        .unwrap();
    let err = report.get("v0").unwrap().as_ref().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<VehicleError>(),
        Some(VehicleError::FenceViolation { .. })
    ));

    let report = fleet
        .goto(&names, Arg::Shared(Waypoint::ned(4.0, -1.0, -2.0)))
        .await
        .unwrap();
    assert!(report.all_ok(), "{report}");
    assert!(wait_until(Duration::from_secs(1), || vehicle.position() == [4.0, -1.0, -2.0]).await);

    let err = fleet
        .goto(&names, Arg::Shared(Waypoint::global(47.0, 8.0, 500.0)))
        .await
        .unwrap()
        .outcomes
        .remove(0)
        .1
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<VehicleError>(), Some(VehicleError::UnsupportedFrame)));

    fleet.close().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_manual_input_floors_at_the_north_margin() {
    let vehicle = SimulatedVehicle::new(1);
    let (fleet, sim) = sim_fleet(&[vehicle.clone()]);
    let names = connect_all(&fleet, 1).await;
    let names = as_strs(&names);
    let v0 = fleet.vehicle("v0").unwrap();

    let fence = Fence::new((-5.0, 5.0), (-5.0, 5.0), (-10.0, 0.0), 1).unwrap();
    fleet.set_fence(&names, Arg::Shared(Some(fence))).await.unwrap();
    fleet
        .goto(&names, Arg::Shared(Waypoint::ned(4.0, 0.0, -2.0)))
        .await
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            v0.telemetry().position.is_some_and(|p| (p[0] - 4.0).abs() < 1e-6)
        })
        .await
    );

    let report = fleet
        .manual_control(&names, Arg::Shared(ManualInput::new(1.0, 0.0, 0.0, 0.0)))
        .await
        .unwrap();
    let sent = report.get("v0").unwrap().as_ref().unwrap();
    assert!(sent.forward.abs() < 1e-9);
    assert!(wait_until(Duration::from_secs(1), || vehicle.last_manual().is_some_and(|m| m[0] == 0)).await);

    // Backing away from the bound is untouched.
    let report = fleet
        .manual_control(&names, Arg::Shared(ManualInput::new(-0.5, 0.0, 0.0, 0.0)))
        .await
        .unwrap();
    assert!((report.get("v0").unwrap().as_ref().unwrap().forward + 0.5).abs() < 1e-9);

    fleet.close().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_refuses_armed_unless_forced() {
    let (fleet, sim) = sim_fleet(&two_vehicles());
    let names = connect_all(&fleet, 2).await;
    let removed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&removed);
    fleet.on_vehicle_removed(move |_name| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    fleet.arm(&["v0"]).await.unwrap();
    let report = fleet.disconnect(&as_strs(&names), false).await;
    assert!(report.get("v1").unwrap().is_ok());
    let err = report.get("v0").unwrap().as_ref().unwrap_err();
    assert!(matches!(err.downcast_ref::<VehicleError>(), Some(VehicleError::Armed(_))));
    assert_eq!(fleet.names(), vec!["v0".to_string()]);

    let report = fleet.disconnect(&["v0", "ghost"], true).await;
    assert!(report.all_ok());
    assert_eq!(report.len(), 1);
    assert!(fleet.is_empty());
    assert_eq!(removed.load(Ordering::SeqCst), 2);

    sim.shutdown().await;
}

#[tokio::test]
async fn test_scheduled_actions_run_in_order() {
    let (fleet, sim) = sim_fleet(&[SimulatedVehicle::new(1)]);
    connect_all(&fleet, 1).await;
    let v0 = fleet.vehicle("v0").unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let runs = (0..3).map(|i| {
        let order = Arc::clone(&order);
        v0.schedule(async move {
            tokio::time::sleep(Duration::from_millis(30 - i * 10)).await;
            order.lock().unwrap().push(i);
            Ok(())
        })
    });
    for result in futures::future::join_all(runs).await {
        result.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

    fleet.close().await;
    assert!(v0.schedule(async { Ok(()) }).await.is_err());
    sim.shutdown().await;
}

#[tokio::test]
async fn test_action_stop_with_no_names_stops_everyone() {
    let vehicles = two_vehicles();
    let (fleet, sim) = sim_fleet(&vehicles);
    let names = connect_all(&fleet, 2).await;
    let names = as_strs(&names);
    assert!(fleet.arm(&names).await.unwrap().all_ok());
    assert!(fleet.takeoff(&names, Arg::Shared(10.0)).await.unwrap().all_ok());

    let queued = {
        let fleet = Arc::clone(&fleet);
        tokio::spawn(async move { fleet.wait(&["v0", "v1"], Arg::Shared(Duration::from_secs(30))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = fleet.action_stop(&[]).await.unwrap();
    assert_eq!(report.outcomes.len(), 2);
    assert!(report.all_ok(), "{report}");

    // The long wait was aborted on both vehicles instead of running out.
    let waited = tokio::time::timeout(Duration::from_secs(2), queued)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(waited.failed().count(), 2, "{waited}");
    for vehicle in &vehicles {
        assert_eq!(vehicle.commands().last(), Some(&MavCmd::MAV_CMD_NAV_LAND));
        assert!(vehicle.position()[2].abs() < 1e-6);
    }

    fleet.close().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_kill_terminates_only_the_selection() {
    let vehicles = two_vehicles();
    let (fleet, sim) = sim_fleet(&vehicles);
    let names = connect_all(&fleet, 2).await;
    let names = as_strs(&names);
    assert!(fleet.arm(&names).await.unwrap().all_ok());

    let report = fleet.kill(&["v1"]).await.unwrap();
    assert!(report.all_ok(), "{report}");
    assert!(vehicles[0].is_armed());
    assert!(!vehicles[1].is_armed());
    assert!(!fleet.vehicle("v1").unwrap().is_armed());
    assert!(vehicles[1]
        .commands()
        .contains(&MavCmd::MAV_CMD_DO_FLIGHTTERMINATION));

    assert!(matches!(
        fleet.kill(&["v9"]).await,
        Err(DispatchError::UnknownVehicles(ref n)) if n == &["v9".to_string()]
    ));

    // An empty selection takes the rest of the fleet down too.
    assert!(fleet.kill(&[]).await.unwrap().all_ok());
    assert!(!vehicles[0].is_armed());

    fleet.close().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_pause_holds_scheduled_actions_until_resume() {
    let (fleet, sim) = sim_fleet(&two_vehicles());
    let names = connect_all(&fleet, 2).await;
    let names = as_strs(&names);
    let v0 = fleet.vehicle("v0").unwrap();

    assert!(fleet.pause(&names).await.unwrap().all_ok());
    assert!(v0.is_paused());

    let ran = Arc::new(AtomicUsize::new(0));
    let pending = {
        let ran = Arc::clone(&ran);
        let v0 = Arc::clone(&v0);
        tokio::spawn(async move {
            v0.schedule(async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    // Immediate commands are not held back by a paused queue.
    assert!(fleet.arm(&["v0"]).await.unwrap().all_ok());

    assert!(fleet.resume(&["v0"]).await.unwrap().all_ok());
    pending.await.unwrap().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(!v0.is_paused());
    assert!(fleet.vehicle("v1").unwrap().is_paused());

    fleet.close().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn test_wait_delays_later_scheduled_actions() {
    let (fleet, sim) = sim_fleet(&two_vehicles());
    let names = connect_all(&fleet, 2).await;
    let names = as_strs(&names);
    let v0 = fleet.vehicle("v0").unwrap();

    assert!(matches!(
        fleet.wait(&names, Arg::PerVehicle(vec![Duration::from_millis(10)])).await,
        Err(DispatchError::ArgumentMismatch { expected: 2, got: 1 })
    ));

    let started = tokio::time::Instant::now();
    let (waited, after) = tokio::join!(
        fleet.wait(
            &names,
            Arg::PerVehicle(vec![Duration::from_millis(150), Duration::ZERO])
        ),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            v0.schedule(async move { Ok(started.elapsed()) }).await
        }
    );
    assert!(waited.unwrap().all_ok());
    assert!(after.unwrap() >= Duration::from_millis(150));

    fleet.close().await;
    sim.shutdown().await;
}
