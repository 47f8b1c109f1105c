fn main() {
    qwen_relay::run();
}
