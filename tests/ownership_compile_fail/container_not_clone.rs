use sandcell::Container;

fn duplicate(container: Container) -> (Container, Container) {
    let second = container.clone();
    (container, second)
}

fn main() {}
