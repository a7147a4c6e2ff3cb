pub mod config;
pub mod control_loop;
pub mod controller;
pub mod defuzzifier;
pub mod fuzzifier;
pub mod imu_conditioner;
pub mod imu_transport;
pub mod lsm6ds3tr;
pub mod mpu6050;
pub mod perturbations;
pub mod pwm_motor;
pub mod rule_engine;
pub mod simulator;
pub mod telemetry;
