fn main() {
    harvester_lib::run()
}
