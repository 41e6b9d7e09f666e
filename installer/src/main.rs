fn main() {
    std::process::exit(stack_installer::run());
}
