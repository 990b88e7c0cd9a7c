use chamber_controller::clock::MonotonicClock;
use chamber_controller::controller::{control_task, pwm_task};
use chamber_controller::data_logger::data_log_task;
use chamber_controller::hardware_sim::{simulation_task, SimulatedHardware};
use chamber_controller::profile::{ProfileDefinition, ProfileStep, SCHEMA_VERSION};
use chamber_controller::settings::MemorySettingsStore;
use chamber_controller::{Chamber, CURRENT_STATE};
use embassy_executor::Spawner;
use embassy_time::Timer;
use log::{error, info};
use static_cell::StaticCell;

static HARDWARE: StaticCell<SimulatedHardware> = StaticCell::new();
static SETTINGS: StaticCell<MemorySettingsStore> = StaticCell::new();
static CLOCK: StaticCell<MonotonicClock> = StaticCell::new();
static CHAMBER: StaticCell<Chamber> = StaticCell::new();

fn demo_profile() -> ProfileDefinition {
    ProfileDefinition {
        schema_version: SCHEMA_VERSION,
        name: "Demo bake".into(),
        description: "ramp, soak, cool back down".into(),
        steps: vec![
            ProfileStep::Direct { setpoint_c: 40.0 },
            ProfileStep::RampTime {
                setpoint_c: 120.0,
                ramp_time_s: 60.0,
            },
            ProfileStep::Soak {
                setpoint_c: 120.0,
                soak_time_s: 30.0,
                guaranteed: false,
                deviation_c: None,
            },
            ProfileStep::Direct { setpoint_c: 30.0 },
            ProfileStep::Wait {
                wait_time_s: Some(30.0),
                pv_target_c: None,
            },
        ],
    }
}

/// Uploads the demo profile, starts it and narrates the run.
#[embassy_executor::task]
async fn demo_task(chamber: &'static Chamber) {
    // Let the first control ticks seed the process value.
    Timer::after_millis(1000).await;

    {
        let mut controller = chamber.controller.lock().await;
        let mut engine = chamber.profile.lock().await;
        if let Err(errors) = engine.set_uploaded_profile(demo_profile()) {
            for error in errors {
                error!("profile rejected: {error}");
            }
            return;
        }
        if let Err(err) = engine.start_from_uploaded(&mut *controller) {
            error!("profile start failed: {err}");
            return;
        }
    }

    let mut receiver = CURRENT_STATE.receiver().expect("watch receiver available");
    loop {
        let status = receiver.changed().await;
        info!(
            "state={} sp={:6.1} pv={:6.1} out={:6.1} servo={:5.1} profile={}/{} ({})",
            status.controller.state.as_str(),
            status.controller.setpoint_c,
            status.controller.process_value_c,
            status.controller.pid_output,
            status.controller.servo_angle_deg,
            status.profile.current_step_number,
            status.profile.current_step_type,
            status.profile.last_end_reason.as_str(),
        );
        if !status.profile.running {
            break;
        }
        Timer::after_millis(1000).await;
    }

    let reason = chamber.profile.lock().await.last_end_reason();
    info!("profile run finished: {}", reason.as_str());
    let points = chamber.logger.lock().await.point_count();
    info!("data logger captured {points} points");
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_millis()
        .init();

    let hardware = &*HARDWARE.init(SimulatedHardware::new());
    let settings = &*SETTINGS.init(MemorySettingsStore::new());
    let clock = &*CLOCK.init(MonotonicClock);
    let chamber = &*CHAMBER.init(Chamber::new(hardware, settings, clock));

    info!("chamber controller {} (simulated plant)", chamber_controller::VERSION);

    spawner.spawn(simulation_task(hardware)).unwrap();
    spawner.spawn(control_task(chamber)).unwrap();
    spawner.spawn(pwm_task(chamber)).unwrap();
    spawner.spawn(data_log_task(chamber)).unwrap();
    spawner.spawn(demo_task(chamber)).unwrap();
}
