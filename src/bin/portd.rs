fn main() {
    portd_cmd::cmd::run();
}
