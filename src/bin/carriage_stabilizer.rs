use carriage_stabilizer::control_loop::control_main;

fn main() {
    control_main("Carriage-Stabilizer");
}
